//! USIM file system backed by an XML document
//!
//! The document mirrors the card: `<MF path="3F00">` holds `<DF>`/`<ADF>`
//! directories and `<EF id="...">` files, and every EF lists canned
//! `<SIMIO cmd p1 p2 p3>` answers. `PinProfile`, `FacilityLock`, `CIMI`,
//! `CCID` and the `STK` menu tree sit beside the MF.

use std::fs;
use std::path::{Path, PathBuf};

use xmltree::{Element, XMLNode};

use crate::error::{ModemError, Result};
use crate::pdu::bcd_to_string;

pub const DEFAULT_PROFILE: &str = include_str!("../assets/iccprofile_for_sim0.xml");
pub const CARRIER_TEST_PROFILE: &str = include_str!("../assets/iccprofile_cts.xml");

pub const COMMAND_READ_BINARY: u8 = 0xB0;
pub const COMMAND_READ_RECORD: u8 = 0xB2;
pub const COMMAND_GET_RESPONSE: u8 = 0xC0;
pub const COMMAND_UPDATE_BINARY: u8 = 0xD6;
pub const COMMAND_UPDATE_RECORD: u8 = 0xDC;

pub const EF_ICCID: &str = "2FE2";
pub const EF_IMSI: &str = "6F07";
pub const EF_MSISDN: &str = "6F40";
pub const EF_FDN: &str = "6F3B";

pub const PATH_MF: &str = "3F00";
pub const PATH_DF_TELECOM: &str = "3F007F10";
pub const PATH_DF_PHONEBOOK: &str = "3F007F105F3A";
pub const PATH_ADF_USIM: &str = "3F007FFF";

const SW_SUCCESS: &str = "144,0";
const SW_FILE_NOT_FOUND: &str = "106,130";

/// Bytes of an ADN record after the alpha identifier
const ADN_FOOTER_BYTES: usize = 14;

/// Directory that holds `file_id` when the request carries no path
pub fn default_ef_path(file_id: &str) -> &'static str {
    match file_id {
        "2FE2" | "2F05" | "2F00" | "2F06" => PATH_MF,
        "6F3A" | "6F3B" | "6F3C" | "6F4A" | "6F4B" | "6F4C" | "6F4F" | "6F54" | "6F58" => {
            PATH_DF_TELECOM
        }
        "4F30" | "4F3A" | "4F09" | "4F11" | "4F26" | "4F4A" | "4F61" => PATH_DF_PHONEBOOK,
        _ => PATH_ADF_USIM,
    }
}

/// One `+CRSM` request, already converted to hex where the card stores hex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimIo {
    pub command: u8,
    pub file_id: String,
    pub p1: u8,
    pub p2: u8,
    pub p3: u8,
    pub data: Option<String>,
    pub path: Option<String>,
}

impl SimIo {
    fn read_command(&self) -> u8 {
        match self.command {
            COMMAND_UPDATE_BINARY => COMMAND_READ_BINARY,
            COMMAND_UPDATE_RECORD => COMMAND_READ_RECORD,
            other => other,
        }
    }

    fn is_update(&self) -> bool {
        matches!(self.command, COMMAND_UPDATE_BINARY | COMMAND_UPDATE_RECORD)
    }

    fn resolved_path(&self) -> String {
        match self.path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => path.to_ascii_uppercase(),
            _ => default_ef_path(&self.file_id).to_string(),
        }
    }
}

/// Persisted PIN/PUK codes and retry counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinProfile {
    pub pin1: String,
    pub puk1: String,
    pub pin1_remaining: u32,
    pub puk1_remaining: u32,
    pub pin2: String,
    pub puk2: String,
    pub pin2_remaining: u32,
    pub puk2_remaining: u32,
    pub sim_status: String,
}

// Element names under <PinProfile>
const PIN_FIELDS: [&str; 9] = [
    "PINCODE",
    "PUKCODE",
    "PINREMAINTIMES",
    "PUKREMAINTIMES",
    "PIN2CODE",
    "PUK2CODE",
    "PIN2REMAINTIMES",
    "PUK2REMAINTIMES",
    "SIMSTATUS",
];

impl Default for PinProfile {
    fn default() -> Self {
        Self {
            pin1: "1234".to_string(),
            puk1: "12345678".to_string(),
            pin1_remaining: 3,
            puk1_remaining: 10,
            pin2: "5678".to_string(),
            puk2: "87654321".to_string(),
            pin2_remaining: 3,
            puk2_remaining: 10,
            sim_status: "READY".to_string(),
        }
    }
}

impl PinProfile {
    fn to_fields(&self) -> [String; 9] {
        [
            self.pin1.clone(),
            self.puk1.clone(),
            self.pin1_remaining.to_string(),
            self.puk1_remaining.to_string(),
            self.pin2.clone(),
            self.puk2.clone(),
            self.pin2_remaining.to_string(),
            self.puk2_remaining.to_string(),
            self.sim_status.clone(),
        ]
    }
}

/// A node of the SIM Toolkit menu tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkMenuItem {
    /// Proactive command as hex
    pub text: String,
    /// Proactive command type (`cmd` attribute), e.g. `24` for SELECT ITEM
    pub command: String,
}

pub struct IccProfile {
    root: Element,
    path: Option<PathBuf>,
}

impl IccProfile {
    /// Parse a profile that is not tied to a file
    pub fn from_xml(text: &str) -> Result<Self> {
        let root = Element::parse(text.as_bytes())?;
        if root.name != "IccProfile" {
            return Err(ModemError::InvalidConfig(format!(
                "unexpected ICC root element <{}>",
                root.name
            )));
        }
        Ok(Self { root, path: None })
    }

    /// Load `path`, seeding it from `default_xml` when absent or unreadable
    pub fn load(path: impl Into<PathBuf>, default_xml: &str) -> Result<Self> {
        let path = path.into();
        let mut profile = match fs::read_to_string(&path) {
            Ok(text) => match Self::from_xml(&text) {
                Ok(profile) => profile,
                Err(e) => {
                    log::warn!("ICC profile {} unusable ({}), using defaults", path.display(), e);
                    Self::from_xml(default_xml)?
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("creating ICC profile {}", path.display());
                Self::from_xml(default_xml)?
            }
            Err(e) => return Err(e.into()),
        };
        profile.path = Some(path);
        profile.save()?;
        Ok(profile)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the document back to its file, if it has one
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut buf = Vec::new();
        self.root
            .write(&mut buf)
            .map_err(|e| ModemError::XmlWrite(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("xml.tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, path)?;
        log::debug!("saved ICC profile to {}", path.display());
        Ok(())
    }

    /// Answer a `+CRSM` request as `sw1,sw2[,data]`
    pub fn sim_io(&mut self, request: &SimIo) -> String {
        let path = request.resolved_path();
        let file_id = request.file_id.to_ascii_uppercase();

        if request.is_update() {
            let Some(ef) = locate_ef_mut(&mut self.root, &path, &file_id) else {
                log::debug!("SIM-IO update of unknown EF {}/{}", path, file_id);
                return SW_FILE_NOT_FOUND.to_string();
            };
            let data = request.data.as_deref().unwrap_or("").to_ascii_uppercase();
            let text = format!("{},{}", SW_SUCCESS, data);
            match child_mut(ef, |e| simio_matches(e, request)) {
                Some(entry) => set_text(entry, text),
                None => {
                    let mut entry = Element::new("SIMIO");
                    entry.attributes.insert("cmd".to_string(), format!("{:02X}", request.read_command()));
                    entry.attributes.insert("p1".to_string(), format!("{:02X}", request.p1));
                    entry.attributes.insert("p2".to_string(), format!("{:02X}", request.p2));
                    entry.attributes.insert("p3".to_string(), format!("{:02X}", request.p3));
                    entry.children.push(XMLNode::Text(text));
                    ef.children.push(XMLNode::Element(entry));
                }
            }
            if let Err(e) = self.save() {
                log::warn!("failed to flush ICC profile: {}", e);
            }
            return SW_SUCCESS.to_string();
        }

        let response = locate_ef(&self.root, &path, &file_id)
            .and_then(|ef| child(ef, |e| simio_matches(e, request)))
            .map(text_of);
        match response {
            Some(text) => text,
            None => {
                log::debug!(
                    "no SIM-IO answer for {:02X} {}/{} {:02X} {:02X} {:02X}",
                    request.command,
                    path,
                    file_id,
                    request.p1,
                    request.p2,
                    request.p3
                );
                SW_FILE_NOT_FOUND.to_string()
            }
        }
    }

    pub fn imsi(&self) -> Option<String> {
        child(&self.root, |e| e.name == "CIMI").map(text_of)
    }

    pub fn iccid(&self) -> Option<String> {
        child(&self.root, |e| e.name == "CCID").map(text_of)
    }

    /// Subscriber number from the first EF_MSISDN record
    pub fn msisdn(&self) -> Option<String> {
        self.record_numbers(PATH_ADF_USIM, EF_MSISDN).into_iter().next()
    }

    /// Every number stored in EF_FDN
    pub fn fdn_numbers(&self) -> Vec<String> {
        self.record_numbers(PATH_DF_TELECOM, EF_FDN)
    }

    fn record_numbers(&self, path: &str, file_id: &str) -> Vec<String> {
        let Some(ef) = locate_ef(&self.root, path, file_id) else {
            return Vec::new();
        };
        children(ef)
            .filter(|e| e.name == "SIMIO" && attr_eq(e, "cmd", "B2"))
            .filter_map(|e| {
                let text = text_of(e);
                let record = text.splitn(3, ',').nth(2)?.to_string();
                parse_adn_number(&record)
            })
            .collect()
    }

    pub fn pin_profile(&self) -> PinProfile {
        let Some(section) = child(&self.root, |e| e.name == "PinProfile") else {
            return PinProfile::default();
        };
        let field = |name: &str| child(section, |e| e.name == name).map(text_of);
        let count = |name: &str, fallback: u32| {
            field(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };
        let defaults = PinProfile::default();
        PinProfile {
            pin1: field("PINCODE").unwrap_or(defaults.pin1),
            puk1: field("PUKCODE").unwrap_or(defaults.puk1),
            pin1_remaining: count("PINREMAINTIMES", defaults.pin1_remaining),
            puk1_remaining: count("PUKREMAINTIMES", defaults.puk1_remaining),
            pin2: field("PIN2CODE").unwrap_or(defaults.pin2),
            puk2: field("PUK2CODE").unwrap_or(defaults.puk2),
            pin2_remaining: count("PIN2REMAINTIMES", defaults.pin2_remaining),
            puk2_remaining: count("PUK2REMAINTIMES", defaults.puk2_remaining),
            sim_status: field("SIMSTATUS").unwrap_or(defaults.sim_status),
        }
    }

    pub fn set_pin_profile(&mut self, profile: &PinProfile) {
        let section = section_mut(&mut self.root, "PinProfile");
        for (name, value) in PIN_FIELDS.iter().zip(profile.to_fields()) {
            let entry = section_mut(section, name);
            set_text(entry, value);
        }
    }

    /// Facility locks as `(name, enabled)` in document order
    pub fn facility_locks(&self) -> Vec<(String, bool)> {
        let Some(section) = child(&self.root, |e| e.name == "FacilityLock") else {
            return Vec::new();
        };
        children(section)
            .filter(|e| e.name == "FACILITY")
            .filter_map(|e| {
                let name = e.attributes.get("name")?.clone();
                Some((name, text_of(e).eq_ignore_ascii_case("ENABLE")))
            })
            .collect()
    }

    pub fn set_facility_lock(&mut self, name: &str, enabled: bool) {
        let section = section_mut(&mut self.root, "FacilityLock");
        let value = if enabled { "ENABLE" } else { "DISABLE" };
        match child_mut(section, |e| e.name == "FACILITY" && attr_eq(e, "name", name)) {
            Some(entry) => set_text(entry, value.to_string()),
            None => {
                let mut entry = Element::new("FACILITY");
                entry.attributes.insert("name".to_string(), name.to_string());
                entry.children.push(XMLNode::Text(value.to_string()));
                section.children.push(XMLNode::Element(entry));
            }
        }
    }

    /// Whether an application with `aid` exists on the card
    pub fn has_application(&self, aid: &str) -> bool {
        find_application(&self.root, aid).is_some()
    }

    /// Canned answer to an APDU sent over a logical channel to `aid`
    pub fn logical_channel_response(&self, aid: &str, apdu: &str) -> Option<String> {
        let application = find_application(&self.root, aid)?;
        child(application, |e| e.name == "CGLA" && attr_eq(e, "apdu", apdu)).map(text_of)
    }

    /// Text of the top-level SETUP MENU command
    pub fn stk_setup_menu(&self) -> Option<String> {
        self.stk_root().map(text_of).filter(|t| !t.is_empty())
    }

    /// Menu item reached by following `menu_ids` from the top-level menu
    pub fn stk_item(&self, menu_ids: &[u32]) -> Option<StkMenuItem> {
        let mut node = self.stk_root()?;
        for id in menu_ids {
            let id = id.to_string();
            node = child(node, |e| e.name == "SELECTITEM" && attr_eq(e, "menuId", &id))?;
        }
        Some(StkMenuItem {
            text: text_of(node),
            command: node.attributes.get("cmd").cloned().unwrap_or_default(),
        })
    }

    fn stk_root(&self) -> Option<&Element> {
        let stk = child(&self.root, |e| e.name == "STK")?;
        child(stk, |e| e.name == "SETUPMENU")
    }
}

/// Dialing number stored in an ADN-format record, `None` for empty records
pub fn parse_adn_number(record: &str) -> Option<String> {
    let record = record.trim();
    let footer_len = ADN_FOOTER_BYTES * 2;
    if record.len() < footer_len || !record.is_ascii() {
        return None;
    }
    let footer = &record[record.len() - footer_len..];
    let length = u8::from_str_radix(&footer[0..2], 16).ok()?;
    if length < 2 || length == 0xFF {
        return None;
    }
    // Length counts the TON/NPI byte; at most 10 BCD bytes follow it
    let bcd_len = (usize::from(length) - 1).min(10) * 2;
    let digits = bcd_to_string(&footer[4..4 + bcd_len]);
    let digits = digits.trim_end_matches(|c: char| c == 'F' || c == 'f');
    if digits.is_empty() {
        return None;
    }
    Some(digits.to_string())
}

fn children(el: &Element) -> impl Iterator<Item = &Element> {
    el.children.iter().filter_map(|node| match node {
        XMLNode::Element(e) => Some(e),
        _ => None,
    })
}

fn child(el: &Element, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
    children(el).find(|e| pred(e))
}

fn child_mut(el: &mut Element, pred: impl Fn(&Element) -> bool) -> Option<&mut Element> {
    el.children.iter_mut().find_map(|node| match node {
        XMLNode::Element(e) if pred(e) => Some(e),
        _ => None,
    })
}

/// Child element `name`, created when missing
fn section_mut<'a>(el: &'a mut Element, name: &str) -> &'a mut Element {
    let index = el
        .children
        .iter()
        .position(|node| matches!(node, XMLNode::Element(e) if e.name == name));
    let index = match index {
        Some(index) => index,
        None => {
            el.children.push(XMLNode::Element(Element::new(name)));
            el.children.len() - 1
        }
    };
    match &mut el.children[index] {
        XMLNode::Element(e) => e,
        _ => unreachable!("index points at an element"),
    }
}

fn attr_eq(el: &Element, name: &str, value: &str) -> bool {
    el.attributes
        .get(name)
        .is_some_and(|v| v.eq_ignore_ascii_case(value))
}

/// Concatenated direct text content, trimmed
fn text_of(el: &Element) -> String {
    let mut text = String::new();
    for node in &el.children {
        if let XMLNode::Text(t) | XMLNode::CData(t) = node {
            text.push_str(t);
        }
    }
    text.trim().to_string()
}

/// Replace the element's text, keeping child elements
fn set_text(el: &mut Element, text: String) {
    el.children
        .retain(|node| !matches!(node, XMLNode::Text(_) | XMLNode::CData(_)));
    el.children.insert(0, XMLNode::Text(text));
}

fn simio_matches(el: &Element, request: &SimIo) -> bool {
    let byte = |v: u8| format!("{:02X}", v);
    el.name == "SIMIO"
        && attr_eq(el, "cmd", &byte(request.read_command()))
        && attr_eq(el, "p1", &byte(request.p1))
        && attr_eq(el, "p2", &byte(request.p2))
        // GET RESPONSE answers with the whole FCP whatever length was asked
        && (request.command == COMMAND_GET_RESPONSE || attr_eq(el, "p3", &byte(request.p3)))
        && match el.attributes.get("data") {
            Some(expected) if !request.is_update() => request
                .data
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(expected)),
            _ => true,
        }
}

fn path_components(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() || path.len() % 4 != 0 || !path.is_ascii() {
        return None;
    }
    Some((0..path.len()).step_by(4).map(|i| &path[i..i + 4]).collect())
}

fn locate_ef<'a>(root: &'a Element, path: &str, file_id: &str) -> Option<&'a Element> {
    let components = path_components(path)?;
    let (mf, dirs) = components.split_first()?;
    let mut node = child(root, |e| e.name == "MF" && attr_eq(e, "path", mf))?;
    for dir in dirs {
        node = child(node, |e| e.name != "EF" && attr_eq(e, "path", dir))?;
    }
    child(node, |e| e.name == "EF" && attr_eq(e, "id", file_id))
}

fn locate_ef_mut<'a>(root: &'a mut Element, path: &str, file_id: &str) -> Option<&'a mut Element> {
    let components = path_components(path)?;
    let (mf, dirs) = components.split_first()?;
    let mut node = child_mut(root, |e| e.name == "MF" && attr_eq(e, "path", mf))?;
    for dir in dirs {
        node = child_mut(node, |e| e.name != "EF" && attr_eq(e, "path", dir))?;
    }
    child_mut(node, |e| e.name == "EF" && attr_eq(e, "id", file_id))
}

/// Depth-first search for the directory carrying `aid`
fn find_application<'a>(el: &'a Element, aid: &str) -> Option<&'a Element> {
    for e in children(el) {
        if attr_eq(e, "aid", aid) {
            return Some(e);
        }
        if let Some(found) = find_application(e, aid) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(command: u8, file_id: &str, p1: u8, p2: u8, p3: u8) -> SimIo {
        SimIo {
            command,
            file_id: file_id.to_string(),
            p1,
            p2,
            p3,
            data: None,
            path: None,
        }
    }

    #[test]
    fn test_default_profile_identity() {
        let profile = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.imsi().as_deref(), Some("311740123456789"));
        assert_eq!(profile.iccid().as_deref(), Some("89014103211118510720"));
        assert_eq!(profile.msisdn().as_deref(), Some("15551234567"));
        assert_eq!(profile.fdn_numbers(), vec!["15555255544", "12345"]);
    }

    #[test]
    fn test_sim_io_read_with_default_path() {
        let mut profile = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        let imsi = profile.sim_io(&read(COMMAND_READ_BINARY, EF_IMSI, 0, 0, 9));
        assert_eq!(imsi, "144,0,083911471032547698");

        let iccid = profile.sim_io(&read(COMMAND_READ_BINARY, EF_ICCID, 0, 0, 10));
        assert_eq!(iccid, "144,0,98101430121181157002");

        // Wrong length and unknown file both miss
        assert_eq!(profile.sim_io(&read(COMMAND_READ_BINARY, EF_IMSI, 0, 0, 8)), "106,130");
        assert_eq!(profile.sim_io(&read(COMMAND_READ_BINARY, "6FFF", 0, 0, 1)), "106,130");
    }

    #[test]
    fn test_sim_io_explicit_path_and_get_response() {
        let mut profile = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        let mut request = read(COMMAND_READ_RECORD, "4F30", 1, 4, 0x11);
        request.path = Some("3f007f105f3a".to_string());
        assert!(profile.sim_io(&request).starts_with("144,0,A80D"));

        request.path = Some("3F007FFF".to_string());
        assert_eq!(profile.sim_io(&request), "106,130");

        let fcp = profile.sim_io(&read(COMMAND_GET_RESPONSE, EF_MSISDN, 0, 0, 15));
        assert!(fcp.starts_with("144,0,62"));
    }

    #[test]
    fn test_update_record_visible_to_later_reads() {
        let mut profile = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        let record = "FFFFFFFFFFFFFFFFFFFFFFFFFFFF06811032547698FFFFFFFFFFFFFF";
        let mut update = read(COMMAND_UPDATE_RECORD, EF_MSISDN, 1, 4, 0x1C);
        update.data = Some(record.to_lowercase());
        assert_eq!(profile.sim_io(&update), "144,0");

        let answer = profile.sim_io(&read(COMMAND_READ_RECORD, EF_MSISDN, 1, 4, 0x1C));
        assert_eq!(answer, format!("144,0,{}", record));
        assert_eq!(profile.msisdn().as_deref(), Some("0123456789"));

        // A record the card did not list yet is created
        let mut update = read(COMMAND_UPDATE_RECORD, EF_MSISDN, 2, 4, 0x1C);
        update.data = Some(record.to_string());
        assert_eq!(profile.sim_io(&update), "144,0");
        let answer = profile.sim_io(&read(COMMAND_READ_RECORD, EF_MSISDN, 2, 4, 0x1C));
        assert_eq!(answer, format!("144,0,{}", record));
    }

    #[test]
    fn test_update_binary_and_flush_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iccprofile_for_sim0.xml");
        let mut profile = IccProfile::load(&path, DEFAULT_PROFILE).unwrap();
        assert!(path.exists());

        let mut update = read(COMMAND_UPDATE_BINARY, "6FAD", 0, 0, 4);
        update.data = Some("01000003".to_string());
        assert_eq!(profile.sim_io(&update), "144,0");

        let mut reloaded = IccProfile::load(&path, DEFAULT_PROFILE).unwrap();
        assert_eq!(
            reloaded.sim_io(&read(COMMAND_READ_BINARY, "6FAD", 0, 0, 4)),
            "144,0,01000003"
        );
    }

    #[test]
    fn test_pin_profile_and_facility_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icc.xml");
        let mut profile = IccProfile::load(&path, DEFAULT_PROFILE).unwrap();

        let mut pins = profile.pin_profile();
        assert_eq!(pins, PinProfile::default());
        pins.pin1 = "4321".to_string();
        pins.pin1_remaining = 1;
        pins.sim_status = "SIM PIN".to_string();
        profile.set_pin_profile(&pins);
        profile.set_facility_lock("SC", true);
        profile.set_facility_lock("PN", true);
        profile.save().unwrap();

        let reloaded = IccProfile::load(&path, DEFAULT_PROFILE).unwrap();
        assert_eq!(reloaded.pin_profile(), pins);
        let locks = reloaded.facility_locks();
        assert_eq!(locks.len(), 11);
        assert!(locks.contains(&("SC".to_string(), true)));
        assert!(locks.contains(&("FD".to_string(), false)));
        assert!(locks.contains(&("PN".to_string(), true)));
    }

    #[test]
    fn test_corrupt_profile_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icc.xml");
        fs::write(&path, "<IccProfile><MF>").unwrap();
        let profile = IccProfile::load(&path, DEFAULT_PROFILE).unwrap();
        assert_eq!(profile.imsi().as_deref(), Some("311740123456789"));
        assert!(IccProfile::from_xml("<Other/>").is_err());
    }

    #[test]
    fn test_stk_menu_walk() {
        let profile = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        let menu = profile.stk_setup_menu().unwrap();
        assert!(menu.starts_with("D026810301250082"));

        let browse = profile.stk_item(&[1]).unwrap();
        assert_eq!(browse.command, "24");
        let news = profile.stk_item(&[1, 1]).unwrap();
        assert_eq!(news.command, "21");
        assert!(news.text.ends_with("4E6F206E65777320746F646179"));
        assert!(profile.stk_item(&[3]).is_none());
        assert_eq!(profile.stk_item(&[]).unwrap().text, menu);
    }

    #[test]
    fn test_logical_channel_profiles() {
        let normal = IccProfile::from_xml(DEFAULT_PROFILE).unwrap();
        assert!(normal.has_application("A0000000871002FF86FF0389FFFFFFFF"));
        assert!(!normal.has_application("A00000015141434C00"));

        let cts = IccProfile::from_xml(CARRIER_TEST_PROFILE).unwrap();
        assert_eq!(cts.imsi().as_deref(), Some("311740987654321"));
        let rules = cts
            .logical_channel_response("a00000015141434c00", "80CAFF4000")
            .unwrap();
        assert!(rules.starts_with("FF40") && rules.ends_with("9000"));
        assert!(cts.logical_channel_response("A00000015141434C00", "00B0000000").is_none());
    }

    #[test]
    fn test_parse_adn_number() {
        let international =
            "FFFFFFFFFFFFFFFFFFFFFFFFFFFF079151552143F5FFFFFFFFFFFFFF";
        assert_eq!(parse_adn_number(international).as_deref(), Some("155512345"));
        let empty = "FF".repeat(28);
        assert_eq!(parse_adn_number(&empty), None);
        assert_eq!(parse_adn_number("0781"), None);
    }
}
