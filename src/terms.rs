//! Identifier morphology for generated C names: pluralization, camel
//! casing, all-caps enum constants, sequence counter names.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Words kept fully uppercase when they lead a camelized identifier.
static ABBREVIATIONS: &[&str] = &["uuid", "pci", "zpci", "ptr", "mac", "mtu", "dns", "ip", "dhcp"];

/// Irregular plurals; everything else just gains an `s`.
static PLURALS: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("address", "addresses")]));

/// All-caps fixups for constants that read better fused or split.
static CAPS_FIXUPS: &[(&str, &str)] = &[("NET_DEV", "NETDEV"), ("MACTABLE", "MAC_TABLE")];

/// Split on lower→upper camel transitions: "zeroOrMore" → ["zero","Or","More"].
fn split_words(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    if word.is_empty() {
        return parts;
    }
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut head = 0;
    for w in chars.windows(2) {
        let (_, prev) = w[0];
        let (pos, cur) = w[1];
        if cur.is_uppercase() && !prev.is_uppercase() {
            parts.push(&word[head..pos]);
            head = pos;
        }
    }
    parts.push(&word[head..]);
    parts
}

pub fn pluralize(word: &str) -> String {
    match PLURALS.get(word) {
        Some(p) => (*p).to_string(),
        None => format!("{word}s"),
    }
}

/// Uppercase the first letter only; `str::to_uppercase` on the whole word
/// would clobber interior capitals.
pub fn upper_initial(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    if ABBREVIATIONS.contains(&word) {
        return word.to_uppercase();
    }
    let mut chars = word.chars();
    let first = chars.next().unwrap();
    if first.is_uppercase() {
        return word.to_string();
    }
    first.to_uppercase().collect::<String>() + chars.as_str()
}

pub fn camelize(word: &str) -> String {
    split_words(word).into_iter().map(upper_initial).collect()
}

pub fn allcaps(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let mut ret = split_words(word)
        .into_iter()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join("_");
    for (from, to) in CAPS_FIXUPS {
        ret = ret.replace(&format!("_{from}_"), &format!("_{to}_"));
    }
    ret
}

/// Name of the generated element-count field paired with a sequence member.
pub fn counter_name(name: &str) -> String {
    let mut plural = pluralize(name);
    if !plural.chars().all(|c| !c.is_uppercase()) {
        plural = upper_initial(&plural);
    }
    format!("n{plural}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camelize_splits_on_case_transitions() {
        assert_eq!(camelize("zeroOrMore"), "ZeroOrMore");
        assert_eq!(camelize("anyName"), "AnyName");
        assert_eq!(camelize("mtu"), "MTU");
    }

    #[test]
    fn upper_initial_preserves_interior_capitals() {
        assert_eq!(upper_initial("ipAddr"), "IpAddr");
        assert_eq!(upper_initial("Already"), "Already");
        assert_eq!(upper_initial(""), "");
    }

    #[test]
    fn counter_names() {
        assert_eq!(counter_name("route"), "nroutes");
        assert_eq!(counter_name("address"), "naddresses");
        assert_eq!(counter_name("dnssrv"), "ndnssrvs");
        assert_eq!(counter_name("ipAddr"), "nIpAddrs");
    }

    #[test]
    fn allcaps_applies_fixups() {
        assert_eq!(allcaps("forwardNatAddress"), "FORWARD_NAT_ADDRESS");
        assert_eq!(allcaps("hostNetDevName"), "HOST_NETDEV_NAME");
    }
}
