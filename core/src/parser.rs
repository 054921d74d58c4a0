//! Field extraction for AT command arguments
//!
//! A `CommandParser` is a cursor over the unparsed tail of a command line.
//! Each `next_*` call consumes one comma separated field.

pub struct CommandParser<'a> {
    tail: &'a str,
}

impl<'a> CommandParser<'a> {
    pub fn new(command: &'a str) -> Self {
        Self { tail: command }
    }

    /// Remaining unparsed text
    pub fn remaining(&self) -> &'a str {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    /// Advance past the first `=` (the `AT+FOO=` boilerplate)
    pub fn skip_prefix(&mut self) -> &mut Self {
        match self.tail.find('=') {
            Some(pos) => self.tail = &self.tail[pos + 1..],
            None => self.tail = "",
        }
        self
    }

    /// Consume a leading `AT` if present
    pub fn skip_prefix_at(&mut self) -> &mut Self {
        if self.tail.get(..2).is_some_and(|head| head.eq_ignore_ascii_case("AT")) {
            self.tail = &self.tail[2..];
        }
        self
    }

    /// Advance past the next comma
    pub fn skip_comma(&mut self) -> &mut Self {
        match self.tail.find(',') {
            Some(pos) => self.tail = &self.tail[pos + 1..],
            None => self.tail = "",
        }
        self
    }

    /// Contents of the next double-quoted field, or the raw field when it is unquoted
    pub fn next_str(&mut self) -> &'a str {
        let trimmed = self.tail.trim_start();
        let Some(rest) = trimmed.strip_prefix('"') else {
            return self.next_str_until(',').trim();
        };

        let (value, after) = match rest.find('"') {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (rest, ""),
        };

        // Drop anything up to and including the comma that closes this field
        self.tail = match after.find(',') {
            Some(pos) => &after[pos + 1..],
            None => "",
        };
        value
    }

    /// Substring up to `delimiter` (or the end of the tail); the delimiter is consumed
    pub fn next_str_until(&mut self, delimiter: char) -> &'a str {
        match self.tail.find(delimiter) {
            Some(pos) => {
                let value = &self.tail[..pos];
                self.tail = &self.tail[pos + delimiter.len_utf8()..];
                value
            }
            None => {
                let value = self.tail;
                self.tail = "";
                value
            }
        }
    }

    /// Base-10 integer up to the next comma, -1 when empty or malformed
    pub fn next_int(&mut self) -> i32 {
        self.next_int_radix(10)
    }

    /// Base-16 integer up to the next comma, -1 when empty or malformed
    pub fn next_hex_int(&mut self) -> i32 {
        self.next_int_radix(16)
    }

    /// Parse a base-10 field and render it as uppercase hex
    pub fn next_dec_to_hex(&mut self) -> String {
        let value = self.next_int();
        if value < 0 {
            return String::new();
        }
        format!("{:X}", value)
    }

    fn next_int_radix(&mut self, radix: u32) -> i32 {
        let field = self.next_str_until(',').trim().trim_matches('"');
        if field.is_empty() {
            return -1;
        }
        i32::from_str_radix(field, radix).unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_prefix_and_ints() {
        let mut cmd = CommandParser::new("AT+CFUN=1");
        cmd.skip_prefix();
        assert_eq!(cmd.next_int(), 1);
        assert!(cmd.is_empty());
        assert_eq!(cmd.next_int(), -1);
    }

    #[test]
    fn test_quoted_strings_skip_trailing_comma() {
        let mut cmd = CommandParser::new("AT+CLCK=\"SC\",2,\"1234\"");
        cmd.skip_prefix();
        assert_eq!(cmd.next_str(), "SC");
        assert_eq!(cmd.next_int(), 2);
        assert_eq!(cmd.next_str(), "1234");
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_unquoted_string_field() {
        let mut cmd = CommandParser::new("AT+CPIN=1234,5678");
        cmd.skip_prefix();
        assert_eq!(cmd.next_str(), "1234");
        assert_eq!(cmd.next_str(), "5678");
    }

    #[test]
    fn test_hex_and_dec_to_hex() {
        let mut cmd = CommandParser::new("AT+CRSM=178,28480,1,4,28");
        cmd.skip_prefix();
        assert_eq!(cmd.next_dec_to_hex(), "B2");
        assert_eq!(cmd.next_dec_to_hex(), "6F40");
        cmd.skip_comma();
        assert_eq!(cmd.next_int(), 4);

        let mut hex = CommandParser::new("1F,zz");
        assert_eq!(hex.next_hex_int(), 0x1F);
        assert_eq!(hex.next_hex_int(), -1);
    }

    #[test]
    fn test_skip_prefix_at_and_delimiter() {
        let mut cmd = CommandParser::new("at+COPS=3,0;+COPS?");
        cmd.skip_prefix_at();
        assert_eq!(cmd.remaining(), "+COPS=3,0;+COPS?");
        assert_eq!(cmd.next_str_until(';'), "+COPS=3,0");
        assert_eq!(cmd.next_str_until(';'), "+COPS?");
        assert_eq!(cmd.next_str_until(';'), "");
    }

    #[test]
    fn test_skip_prefix_at_on_multibyte_text() {
        let mut cmd = CommandParser::new("Aé+CFUN");
        cmd.skip_prefix_at();
        assert_eq!(cmd.remaining(), "Aé+CFUN");

        let mut short = CommandParser::new("é");
        short.skip_prefix_at();
        assert_eq!(short.remaining(), "é");
    }

    #[test]
    fn test_empty_field_is_minus_one() {
        let mut cmd = CommandParser::new("AT+CCWA=1,,1");
        cmd.skip_prefix();
        assert_eq!(cmd.next_int(), 1);
        assert_eq!(cmd.next_int(), -1);
        assert_eq!(cmd.next_int(), 1);
    }
}
