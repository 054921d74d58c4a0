//! SMS TPDU codec (3GPP TS 23.040)
//!
//! PDUs travel over the AT channel as hex strings. The codec decodes
//! SMS-SUBMIT (from the RIL), SMS-DELIVER and SMS-STATUS-REPORT, and
//! builds the DELIVER / STATUS-REPORT / peer-relay PDUs the simulator emits.
//! It keeps no state and performs no I/O.

use chrono::{DateTime, Datelike, FixedOffset, Local, Offset, Timelike};

use crate::error::{ModemError, Result};

/// Largest user-data payload of a single short message, in octets
pub const MAX_USER_DATA_OCTETS: usize = 140;

/// Prefix used for numbers that address a peer simulator by port
pub const PEER_NUMBER_PREFIX: &str = "1555521";

/// Type-of-address octet for international numbers
pub const TOA_INTERNATIONAL: u8 = 0x91;
/// Type-of-address octet for unknown/national numbers
pub const TOA_UNKNOWN: u8 = 0x81;
const TOA_ALPHANUMERIC: u8 = 0xD0;

const TP_MTI_MASK: u8 = 0x03;
const TP_MMS: u8 = 0x04;
const TP_VPF_MASK: u8 = 0x18;
const TP_SRR: u8 = 0x20;
const TP_UDHI: u8 = 0x40;
const TP_RP: u8 = 0x80;

const TIMESTAMP_CHARS: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Deliver,
    Submit,
    StatusReport,
}

/// Address field: length in semi-octets, type-of-address and the swapped-BCD value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub length: u8,
    pub type_of_address: u8,
    pub value: String,
}

impl Address {
    pub fn from_number(number: &str) -> Self {
        let (digits, type_of_address) = match number.strip_prefix('+') {
            Some(rest) => (rest, TOA_INTERNATIONAL),
            None => (number, TOA_UNKNOWN),
        };
        Self::with_type(digits, type_of_address)
    }

    pub fn with_type(digits: &str, type_of_address: u8) -> Self {
        Self {
            length: digits.len() as u8,
            type_of_address,
            value: string_to_bcd(digits),
        }
    }

    /// Dialable digits carried by the address
    pub fn number(&self) -> String {
        if self.type_of_address & 0xF0 == TOA_ALPHANUMERIC & 0xF0 {
            return self.value.clone();
        }
        bcd_to_string(&self.value)
    }

    pub fn is_international(&self) -> bool {
        self.type_of_address & 0x70 == 0x10
    }

    pub fn encode(&self) -> String {
        format!("{:02X}{:02X}{}", self.length, self.type_of_address, self.value)
    }
}

/// A decoded TPDU plus the SMSC prefix it arrived with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsPdu {
    /// SMSC field including its length octet (`00` when absent)
    pub smsc: String,
    pub first_octet: u8,
    pub message_type: MessageType,
    /// TP-MR, present in SUBMIT and STATUS-REPORT
    pub message_reference: Option<u8>,
    /// TP-DA for SUBMIT, TP-OA for DELIVER, TP-RA for STATUS-REPORT
    pub address: Address,
    pub protocol_id: u8,
    pub data_coding_scheme: u8,
    /// Raw TP-VP field (SUBMIT only)
    pub validity_period: String,
    /// Raw TP-SCTS field (DELIVER / STATUS-REPORT)
    pub timestamp: String,
    /// Raw TP-DT field (STATUS-REPORT only)
    pub discharge_time: String,
    /// TP-ST (STATUS-REPORT only)
    pub status: u8,
    pub user_data_length: u8,
    /// Hex user data; for STATUS-REPORT the optional trailing parameters
    pub user_data: String,
    encoded_len: usize,
}

struct Cursor<'a> {
    pdu: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, chars: usize, field: &str) -> Result<&'a str> {
        let end = self.pos + chars;
        if end > self.pdu.len() {
            return Err(ModemError::InvalidPdu(format!("truncated {}", field)));
        }
        let value = &self.pdu[self.pos..end];
        self.pos = end;
        Ok(value)
    }

    fn octet(&mut self, field: &str) -> Result<u8> {
        let text = self.take(2, field)?;
        u8::from_str_radix(text, 16).map_err(|_| ModemError::InvalidPdu(format!("bad {}", field)))
    }

    fn address(&mut self) -> Result<Address> {
        let length = self.octet("address length")?;
        let type_of_address = self.octet("type of address")?;
        let value_chars = (length as usize).div_ceil(2) * 2;
        let value = self.take(value_chars, "address value")?.to_string();
        Ok(Address {
            length,
            type_of_address,
            value,
        })
    }

    fn rest(&mut self) -> &'a str {
        let value = &self.pdu[self.pos..];
        self.pos = self.pdu.len();
        value
    }
}

impl SmsPdu {
    /// Decode a hex PDU as sent over the AT channel
    pub fn decode(pdu: &str) -> Result<Self> {
        let pdu = pdu.trim();
        if pdu.len() % 2 != 0 || !pdu.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ModemError::InvalidPdu("not an even-length hex string".to_string()));
        }
        let upper = pdu.to_ascii_uppercase();
        let mut cursor = Cursor { pdu: &upper, pos: 0 };

        let smsc_len = cursor.octet("SMSC length")? as usize;
        cursor.pos = 0;
        let smsc = cursor.take(2 + smsc_len * 2, "SMSC address")?.to_string();

        let first_octet = cursor.octet("PDU type")?;
        let message_type = match first_octet & TP_MTI_MASK {
            0x00 => MessageType::Deliver,
            0x01 => MessageType::Submit,
            0x02 => MessageType::StatusReport,
            _ => return Err(ModemError::InvalidPdu("reserved message type".to_string())),
        };

        let mut decoded = SmsPdu {
            smsc,
            first_octet,
            message_type,
            message_reference: None,
            address: Address::with_type("", TOA_UNKNOWN),
            protocol_id: 0,
            data_coding_scheme: 0,
            validity_period: String::new(),
            timestamp: String::new(),
            discharge_time: String::new(),
            status: 0,
            user_data_length: 0,
            user_data: String::new(),
            encoded_len: upper.len(),
        };

        match message_type {
            MessageType::Submit => {
                decoded.message_reference = Some(cursor.octet("message reference")?);
                decoded.address = cursor.address()?;
                decoded.protocol_id = cursor.octet("protocol id")?;
                decoded.data_coding_scheme = cursor.octet("data coding scheme")?;
                let vp_chars = match (first_octet & TP_VPF_MASK) >> 3 {
                    0 => 0,
                    2 => 2,
                    _ => TIMESTAMP_CHARS,
                };
                decoded.validity_period = cursor.take(vp_chars, "validity period")?.to_string();
                decoded.user_data_length = cursor.octet("user data length")?;
                decoded.user_data = cursor.rest().to_string();
            }
            MessageType::Deliver => {
                decoded.address = cursor.address()?;
                decoded.protocol_id = cursor.octet("protocol id")?;
                decoded.data_coding_scheme = cursor.octet("data coding scheme")?;
                decoded.timestamp = cursor.take(TIMESTAMP_CHARS, "timestamp")?.to_string();
                decoded.user_data_length = cursor.octet("user data length")?;
                decoded.user_data = cursor.rest().to_string();
            }
            MessageType::StatusReport => {
                decoded.message_reference = Some(cursor.octet("message reference")?);
                decoded.address = cursor.address()?;
                decoded.timestamp = cursor.take(TIMESTAMP_CHARS, "timestamp")?.to_string();
                decoded.discharge_time = cursor.take(TIMESTAMP_CHARS, "discharge time")?.to_string();
                decoded.status = cursor.octet("status")?;
                decoded.user_data = cursor.rest().to_string();
            }
        }

        if decoded.user_data.len() / 2 > MAX_USER_DATA_OCTETS
            || decoded.user_data_octet_budget() > MAX_USER_DATA_OCTETS
        {
            return Err(ModemError::InvalidPdu("user data exceeds 140 octets".to_string()));
        }
        Ok(decoded)
    }

    /// True when the decoded fields account for every character of the input
    pub fn is_valid_pdu(&self) -> bool {
        self.encode().len() == self.encoded_len
    }

    /// Number the message is addressed to (SUBMIT) or comes from (DELIVER)
    pub fn phone_number(&self) -> String {
        self.address.number()
    }

    pub fn status_report_requested(&self) -> bool {
        self.message_type == MessageType::Submit && self.first_octet & TP_SRR != 0
    }

    /// TPDU length in octets, excluding the SMSC prefix
    pub fn tpdu_octets(&self) -> usize {
        (self.encode().len() - self.smsc.len()) / 2
    }

    /// Maximum user-data octets implied by TP-UDL and the coding scheme
    pub fn user_data_octet_budget(&self) -> usize {
        let udl = self.user_data_length as usize;
        if self.is_gsm7_encoded() {
            (udl * 7).div_ceil(8)
        } else {
            udl
        }
    }

    fn is_gsm7_encoded(&self) -> bool {
        let dcs = self.data_coding_scheme;
        match dcs >> 4 {
            // General data coding: bits 3..2 select the alphabet
            0x0..=0x3 => dcs & 0x0C == 0x00,
            // Message waiting groups: discard/store use the default alphabet
            0xC | 0xD => true,
            0xE => false,
            0xF => dcs & 0x04 == 0,
            _ => false,
        }
    }

    /// Re-serialize the decoded fields
    pub fn encode(&self) -> String {
        let mut pdu = String::with_capacity(self.encoded_len);
        pdu.push_str(&self.smsc);
        pdu.push_str(&format!("{:02X}", self.first_octet));
        match self.message_type {
            MessageType::Submit => {
                pdu.push_str(&format!("{:02X}", self.message_reference.unwrap_or(0)));
                pdu.push_str(&self.address.encode());
                pdu.push_str(&format!("{:02X}{:02X}", self.protocol_id, self.data_coding_scheme));
                pdu.push_str(&self.validity_period);
                pdu.push_str(&format!("{:02X}", self.user_data_length));
            }
            MessageType::Deliver => {
                pdu.push_str(&self.address.encode());
                pdu.push_str(&format!("{:02X}{:02X}", self.protocol_id, self.data_coding_scheme));
                pdu.push_str(&self.timestamp);
                pdu.push_str(&format!("{:02X}", self.user_data_length));
            }
            MessageType::StatusReport => {
                pdu.push_str(&format!("{:02X}", self.message_reference.unwrap_or(0)));
                pdu.push_str(&self.address.encode());
                pdu.push_str(&self.timestamp);
                pdu.push_str(&self.discharge_time);
                pdu.push_str(&format!("{:02X}", self.status));
            }
        }
        pdu.push_str(&self.user_data);
        pdu
    }

    /// SMS-DELIVER handed to the receiving RIL, stamped with the current time
    pub fn create_deliver_pdu(&self) -> String {
        self.create_deliver_pdu_at(&current_time())
    }

    pub fn create_deliver_pdu_at(&self, now: &DateTime<FixedOffset>) -> String {
        if self.message_type != MessageType::Submit {
            return self.encode();
        }

        let mut first_octet = TP_MMS | (self.first_octet & (TP_UDHI | TP_RP));
        if self.status_report_requested() {
            // TP-SRI occupies the same bit as TP-SRR
            first_octet |= TP_SRR;
        }

        format!(
            "00{:02X}{}{:02X}{:02X}{}{:02X}{}",
            first_octet,
            self.address.encode(),
            self.protocol_id,
            self.data_coding_scheme,
            encode_timestamp(now),
            self.user_data_length,
            self.user_data,
        )
    }

    /// Successful-delivery status report (TP-ST = 0) for the given reference
    pub fn create_status_report(&self, message_reference: u8) -> String {
        self.create_status_report_at(message_reference, &current_time())
    }

    pub fn create_status_report_at(&self, message_reference: u8, now: &DateTime<FixedOffset>) -> String {
        let timestamp = encode_timestamp(now);
        format!(
            "00{:02X}{:02X}{}{}{}00",
            TP_MMS | 0x02,
            message_reference,
            self.address.encode(),
            timestamp,
            timestamp,
        )
    }

    /// Rewrite a SUBMIT so its address carries this simulator's port as the
    /// last four digits; the receiving peer replies to that number.
    pub fn create_remote_pdu(&self, host_port: &str) -> Option<String> {
        if self.message_type != MessageType::Submit
            || host_port.len() != 4
            || !host_port.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let mut remote = self.clone();
        remote.address = Address::with_type(&format!("{}{}", PEER_NUMBER_PREFIX, host_port), TOA_UNKNOWN);
        Some(remote.encode())
    }
}

/// Decode-and-check convenience used by the SMS service
pub fn is_valid_pdu(pdu: &str) -> bool {
    SmsPdu::decode(pdu).map(|p| p.is_valid_pdu()).unwrap_or(false)
}

/// Digits to swapped BCD, odd lengths padded with `F`
pub fn string_to_bcd(digits: &str) -> String {
    let mut padded: Vec<char> = digits.chars().collect();
    if padded.len() % 2 != 0 {
        padded.push('F');
    }
    padded
        .chunks(2)
        .flat_map(|pair| [pair[1], pair[0]])
        .collect()
}

/// Swapped BCD back to digits, dropping the odd-length `F` pad
pub fn bcd_to_string(bcd: &str) -> String {
    let chars: Vec<char> = bcd.chars().collect();
    let mut digits: String = chars
        .chunks(2)
        .flat_map(|pair| match pair {
            [low, high] => vec![*high, *low],
            [single] => vec![*single],
            _ => Vec::new(),
        })
        .collect();
    if digits.ends_with(|c| c == 'F' || c == 'f') {
        digits.pop();
    }
    digits
}

/// TP-SCTS: `YYMMDDHHMMSS` plus the zone in quarter hours, every octet nibble-swapped
pub fn encode_timestamp(time: &DateTime<FixedOffset>) -> String {
    let fields = [
        time.year().rem_euclid(100) as u32,
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second(),
    ];
    let mut stamp: String = fields.iter().map(|v| swap_decimal(*v)).collect();

    let quarters = time.offset().local_minus_utc() / (15 * 60);
    let mut zone = u8::from_str_radix(&swap_decimal(quarters.unsigned_abs()), 16).unwrap_or(0);
    if quarters < 0 {
        zone |= 0x08;
    }
    stamp.push_str(&format!("{:02X}", zone));
    stamp
}

fn swap_decimal(value: u32) -> String {
    let text = format!("{:02}", value % 100);
    text.chars().rev().collect()
}

fn current_time() -> DateTime<FixedOffset> {
    let now = Local::now();
    now.with_timezone(&now.offset().fix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::Rng;

    // SUBMIT to 15551234567, status report requested, 7-bit "hellohello"
    const SELF_SUBMIT: &str = "0021000B915155214365F700000AE8329BFD4697D9EC37";

    fn fixed_time() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 10, 18, 9, 5, 7)
            .unwrap()
    }

    #[test]
    fn test_decode_submit() {
        let pdu = SmsPdu::decode(SELF_SUBMIT).unwrap();
        assert_eq!(pdu.message_type, MessageType::Submit);
        assert_eq!(pdu.smsc, "00");
        assert_eq!(pdu.message_reference, Some(0));
        assert_eq!(pdu.phone_number(), "15551234567");
        assert!(pdu.address.is_international());
        assert!(pdu.status_report_requested());
        assert_eq!(pdu.user_data_length, 10);
        assert_eq!(pdu.user_data_octet_budget(), 9);
        assert!(pdu.is_valid_pdu());
        assert_eq!(pdu.encode(), SELF_SUBMIT);
    }

    #[test]
    fn test_decode_skips_smsc_prefix() {
        let with_smsc = format!("07911326040000F0{}", &SELF_SUBMIT[2..]);
        let pdu = SmsPdu::decode(&with_smsc).unwrap();
        assert_eq!(pdu.smsc, "07911326040000F0");
        assert_eq!(pdu.phone_number(), "15551234567");
        assert!(pdu.is_valid_pdu());
    }

    #[test]
    fn test_invalid_pdus_rejected() {
        assert!(!is_valid_pdu(""));
        assert!(!is_valid_pdu("0001"));
        assert!(!is_valid_pdu("0001000D91"));
        assert!(!is_valid_pdu("ZZ01000B915155214365F700000AE8329BFD4697D9EC37"));
        // reserved message type
        assert!(!is_valid_pdu("0003000B915155214365F700000AE8329BFD4697D9EC37"));
        let oversized = format!("0001000B915155214365F70000FF{}", "AA".repeat(141));
        assert!(!is_valid_pdu(&oversized));
    }

    #[test]
    fn test_udl_beyond_one_message_rejected() {
        // 161 septets need 141 octets even though only five are present
        let septets = SmsPdu::decode("0001000B915155214365F70000A1E8329BFD06");
        assert!(septets.is_err());
        // 160 septets fit exactly
        let full = format!("0001000B915155214365F70000A0{}", "AA".repeat(140));
        assert_eq!(SmsPdu::decode(&full).unwrap().user_data_octet_budget(), 140);
        // 8-bit data counts octets directly
        let eight_bit = SmsPdu::decode("0001000B915155214365F700048DE8329BFD06");
        assert!(eight_bit.is_err());
    }

    #[test]
    fn test_submit_with_relative_validity_period() {
        // TP-VPF = relative, VP = 0xAA
        let pdu = SmsPdu::decode("0011000B915155214365F70000AA0AE8329BFD4697D9EC37").unwrap();
        assert_eq!(pdu.validity_period, "AA");
        assert_eq!(pdu.user_data, "E8329BFD4697D9EC37");
        assert!(pdu.is_valid_pdu());
    }

    #[test]
    fn test_deliver_keeps_address_and_user_data() {
        let submit = SmsPdu::decode(SELF_SUBMIT).unwrap();
        let deliver_hex = submit.create_deliver_pdu_at(&fixed_time());
        assert!(is_valid_pdu(&deliver_hex));

        let deliver = SmsPdu::decode(&deliver_hex).unwrap();
        assert_eq!(deliver.message_type, MessageType::Deliver);
        assert_eq!(deliver.address, submit.address);
        assert_eq!(deliver.user_data, submit.user_data);
        assert_eq!(deliver.user_data_length, submit.user_data_length);
        assert_eq!(deliver.timestamp, "62018190507023");
        // MMS plus SRI because the submit asked for a report
        assert_eq!(deliver.first_octet, 0x24);
    }

    #[test]
    fn test_status_report() {
        let submit = SmsPdu::decode(SELF_SUBMIT).unwrap();
        let report_hex = submit.create_status_report_at(7, &fixed_time());
        let report = SmsPdu::decode(&report_hex).unwrap();
        assert_eq!(report.message_type, MessageType::StatusReport);
        assert_eq!(report.message_reference, Some(7));
        assert_eq!(report.status, 0);
        assert_eq!(report.phone_number(), "15551234567");
        assert!(report.is_valid_pdu());
        assert_eq!(report.tpdu_octets(), 25);
    }

    #[test]
    fn test_remote_pdu_encodes_host_port() {
        let submit = SmsPdu::decode(SELF_SUBMIT).unwrap();
        let remote = submit.create_remote_pdu("6520").unwrap();
        let relayed = SmsPdu::decode(&remote).unwrap();
        assert_eq!(relayed.phone_number(), "15555216520");
        assert_eq!(relayed.user_data, submit.user_data);
        assert!(relayed.is_valid_pdu());

        assert!(submit.create_remote_pdu("65201").is_none());
        assert!(submit.create_remote_pdu("65a0").is_none());
    }

    #[test]
    fn test_bcd_conversion() {
        assert_eq!(string_to_bcd("15551234567"), "5155214365F7");
        assert_eq!(bcd_to_string("5155214365F7"), "15551234567");
        assert_eq!(string_to_bcd("6521"), "5612");
        assert_eq!(bcd_to_string(""), "");
    }

    #[test]
    fn test_bcd_round_trip_random_numbers() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(1..=20);
            let number: String = (0..len)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect();
            assert_eq!(bcd_to_string(&string_to_bcd(&number)), number);
        }
    }

    #[test]
    fn test_timestamp_negative_zone() {
        let time = FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2021, 1, 2, 3, 4, 5)
            .unwrap();
        // 20 quarters west: "20" swapped to 0x02, sign bit set
        assert_eq!(encode_timestamp(&time), "1210203040500A");
    }
}
