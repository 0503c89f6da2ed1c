use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinArea {
    pub district: String,
    pub state: String,
}

// Exact 3-digit sorting-district prefixes. Covers the metros and state
// capitals admissions actually see; anything else falls back to the
// postal-circle label below.
const DIRECTORY: &[(&str, &str, &str)] = &[
    ("110", "New Delhi", "Delhi"),
    ("121", "Faridabad", "Haryana"),
    ("122", "Gurugram", "Haryana"),
    ("141", "Ludhiana", "Punjab"),
    ("160", "Chandigarh", "Chandigarh"),
    ("201", "Ghaziabad", "Uttar Pradesh"),
    ("211", "Prayagraj", "Uttar Pradesh"),
    ("226", "Lucknow", "Uttar Pradesh"),
    ("248", "Dehradun", "Uttarakhand"),
    ("302", "Jaipur", "Rajasthan"),
    ("380", "Ahmedabad", "Gujarat"),
    ("395", "Surat", "Gujarat"),
    ("400", "Mumbai", "Maharashtra"),
    ("411", "Pune", "Maharashtra"),
    ("440", "Nagpur", "Maharashtra"),
    ("452", "Indore", "Madhya Pradesh"),
    ("462", "Bhopal", "Madhya Pradesh"),
    ("492", "Raipur", "Chhattisgarh"),
    ("500", "Hyderabad", "Telangana"),
    ("530", "Visakhapatnam", "Andhra Pradesh"),
    ("560", "Bengaluru", "Karnataka"),
    ("600", "Chennai", "Tamil Nadu"),
    ("641", "Coimbatore", "Tamil Nadu"),
    ("682", "Kochi", "Kerala"),
    ("695", "Thiruvananthapuram", "Kerala"),
    ("700", "Kolkata", "West Bengal"),
    ("751", "Bhubaneswar", "Odisha"),
    ("781", "Guwahati", "Assam"),
    ("800", "Patna", "Bihar"),
    ("834", "Ranchi", "Jharkhand"),
];

/// A civilian Indian PIN code: six digits, first digit 1-8.
pub fn is_valid_pin(pin: &str) -> bool {
    let t = pin.trim();
    t.len() == 6
        && t.bytes().all(|b| b.is_ascii_digit())
        && matches!(t.as_bytes()[0], b'1'..=b'8')
}

/// District/state for a PIN whose sorting district is in the directory.
pub fn lookup(pin: &str) -> Option<PinArea> {
    let t = pin.trim();
    if !is_valid_pin(t) {
        return None;
    }
    DIRECTORY
        .iter()
        .find(|(prefix, _, _)| t.starts_with(prefix))
        .map(|(_, district, state)| PinArea {
            district: (*district).to_string(),
            state: (*state).to_string(),
        })
}

/// Postal-circle label for a valid PIN outside the directory, keyed on the
/// leading digit. Too coarse to autofill a district, good enough to show.
pub fn postal_region(pin: &str) -> Option<&'static str> {
    let t = pin.trim();
    if !is_valid_pin(t) {
        return None;
    }
    match t.as_bytes()[0] {
        b'1' => Some("Northern region (Delhi, Haryana, Punjab, HP, J&K)"),
        b'2' => Some("Uttar Pradesh / Uttarakhand"),
        b'3' => Some("Rajasthan / Gujarat"),
        b'4' => Some("Maharashtra / Madhya Pradesh / Chhattisgarh / Goa"),
        b'5' => Some("Telangana / Andhra Pradesh / Karnataka"),
        b'6' => Some("Tamil Nadu / Kerala"),
        b'7' => Some("West Bengal / Odisha / North East"),
        b'8' => Some("Bihar / Jharkhand"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_format_is_six_civilian_digits() {
        assert!(is_valid_pin("110001"));
        assert!(is_valid_pin(" 560034 "));
        assert!(!is_valid_pin("11000"));
        assert!(!is_valid_pin("1100011"));
        assert!(!is_valid_pin("11000a"));
        assert!(!is_valid_pin("010001"));
        // 9xxxxx is the army postal service, not a civilian address.
        assert!(!is_valid_pin("900056"));
        assert!(!is_valid_pin(""));
    }

    #[test]
    fn directory_prefixes_resolve_district_and_state() {
        let delhi = lookup("110001").expect("known prefix");
        assert_eq!(delhi.district, "New Delhi");
        assert_eq!(delhi.state, "Delhi");

        let mumbai = lookup("400068").expect("known prefix");
        assert_eq!(mumbai.district, "Mumbai");
        assert_eq!(mumbai.state, "Maharashtra");

        let kochi = lookup("682025").expect("known prefix");
        assert_eq!(kochi.state, "Kerala");
    }

    #[test]
    fn unknown_but_valid_pin_gets_only_a_region() {
        assert_eq!(lookup("182101"), None);
        assert_eq!(
            postal_region("182101"),
            Some("Northern region (Delhi, Haryana, Punjab, HP, J&K)")
        );
        assert_eq!(postal_region("829110"), Some("Bihar / Jharkhand"));
    }

    #[test]
    fn invalid_pin_resolves_nowhere() {
        assert_eq!(lookup("abc"), None);
        assert_eq!(postal_region("999999"), None);
    }
}
