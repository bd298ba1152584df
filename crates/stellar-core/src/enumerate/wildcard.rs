//! Wildcard-zone detection.
//!
//! Before enumeration starts, a few random labels are probed under the
//! root. A zone that answers the same for labels that cannot exist is a
//! wildcard; its answer becomes a fingerprint used to filter candidates
//! whose IP set matches it.

use std::collections::BTreeSet;

use rand::Rng;

use crate::resolve::{DnsRecordType, ResolverPool};

/// The answer shape a wildcard zone returns for arbitrary labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardFingerprint {
    pub ips: BTreeSet<String>,
    pub cname: Option<String>,
}

/// A random 32-character label that cannot plausibly exist.
fn random_label() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..32)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Extract the (ip set, first cname) shape from resolved records.
pub(crate) fn answer_shape(
    records: &[stellar_db::models::DnsRecordData],
) -> (BTreeSet<String>, Option<String>) {
    let ips = records
        .iter()
        .filter(|r| r.record_type == "A" || r.record_type == "AAAA")
        .map(|r| r.value.clone())
        .collect();
    let cname = records
        .iter()
        .find(|r| r.record_type == "CNAME")
        .map(|r| r.value.to_ascii_lowercase());
    (ips, cname)
}

/// Probe `probes` random labels under `root`. Returns a fingerprint when
/// two or more probes resolve to the same IP set or CNAME.
pub async fn detect(
    resolver: &ResolverPool,
    root: &str,
    probes: usize,
) -> Option<WildcardFingerprint> {
    let mut shapes: Vec<(BTreeSet<String>, Option<String>)> = Vec::new();

    for _ in 0..probes {
        let name = format!("{}.{root}", random_label());
        let Ok(records) = resolver.resolve(&name, DnsRecordType::A).await else {
            continue;
        };
        let shape = answer_shape(&records);
        if shape.0.is_empty() && shape.1.is_none() {
            continue;
        }
        shapes.push(shape);
    }

    for (i, shape) in shapes.iter().enumerate() {
        let matches = shapes
            .iter()
            .skip(i + 1)
            .filter(|other| {
                (!shape.0.is_empty() && other.0 == shape.0)
                    || (shape.1.is_some() && other.1 == shape.1)
            })
            .count();
        if matches >= 1 {
            return Some(WildcardFingerprint {
                ips: shape.0.clone(),
                cname: shape.1.clone(),
            });
        }
    }
    None
}

/// Whether a candidate's resolved answer matches the wildcard fingerprint.
pub fn matches(fingerprint: &WildcardFingerprint, ips: &[String], cname: Option<&str>) -> bool {
    if !fingerprint.ips.is_empty() {
        let candidate: BTreeSet<String> = ips.iter().cloned().collect();
        if !candidate.is_empty() && candidate == fingerprint.ips {
            return true;
        }
    }
    if let (Some(fp_cname), Some(cname)) = (&fingerprint.cname, cname) {
        if fp_cname.eq_ignore_ascii_case(cname) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(ips: &[&str]) -> WildcardFingerprint {
        WildcardFingerprint {
            ips: ips.iter().map(|s| s.to_string()).collect(),
            cname: None,
        }
    }

    #[test]
    fn random_labels_are_long_and_distinct() {
        let a = random_label();
        let b = random_label();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn equal_ip_set_matches() {
        let fingerprint = fp(&["1.2.3.4"]);
        assert!(matches(&fingerprint, &["1.2.3.4".into()], None));
    }

    #[test]
    fn different_ip_set_does_not_match() {
        let fingerprint = fp(&["1.2.3.4"]);
        assert!(!matches(&fingerprint, &["5.6.7.8".into()], None));
        // A superset is a different answer, not the wildcard's.
        assert!(!matches(
            &fingerprint,
            &["1.2.3.4".into(), "5.6.7.8".into()],
            None
        ));
    }

    #[test]
    fn empty_candidate_never_matches() {
        let fingerprint = fp(&["1.2.3.4"]);
        assert!(!matches(&fingerprint, &[], None));
    }

    #[test]
    fn cname_fingerprint_matches_case_insensitively() {
        let fingerprint = WildcardFingerprint {
            ips: BTreeSet::new(),
            cname: Some("wild.cdn.test".into()),
        };
        assert!(matches(&fingerprint, &[], Some("Wild.CDN.Test")));
        assert!(!matches(&fingerprint, &[], Some("other.cdn.test")));
        assert!(!matches(&fingerprint, &[], None));
    }
}
