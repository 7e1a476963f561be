//! Parsing of `/proc/<pid>/uid_map`.
//!
//! Each line is `<inside> <outside> <length>`. An unremapped namespace reports
//! the single line `0 0 4294967295`.

/// Length of the identity mapping in an unremapped user namespace.
pub const FULL_RANGE_LENGTH: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapRange {
    pub inside: u64,
    pub outside: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdMapping {
    /// uid 0 inside is uid 0 outside across the whole id space.
    Unremapped,
    Remapped(Vec<IdMapRange>),
    Unparseable(String),
}

impl IdMapping {
    pub fn is_remapped(&self) -> bool {
        matches!(self, IdMapping::Remapped(_))
    }
}

pub fn parse_id_map(text: &str) -> IdMapping {
    let mut ranges = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let parsed = match fields.as_slice() {
            [inside, outside, length] => (|| {
                Some(IdMapRange {
                    inside: inside.parse().ok()?,
                    outside: outside.parse().ok()?,
                    length: length.parse().ok()?,
                })
            })(),
            _ => None,
        };
        match parsed {
            Some(range) => ranges.push(range),
            None => return IdMapping::Unparseable(line.to_string()),
        }
    }

    if ranges.is_empty() {
        return IdMapping::Unparseable(String::new());
    }

    let root = ranges.iter().find(|r| r.inside == 0);
    match root {
        // Root mapped to host root is not isolation, whether over the full range or a part of it.
        Some(r) if r.outside == 0 => IdMapping::Unremapped,
        _ => IdMapping::Remapped(ranges),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_identity_range_is_unremapped() {
        assert_eq!(
            parse_id_map("         0          0 4294967295\n"),
            IdMapping::Unremapped
        );
    }

    #[test]
    fn shifted_root_is_remapped() {
        let mapping = parse_id_map("0 165536 65536\n");
        assert_eq!(
            mapping,
            IdMapping::Remapped(vec![IdMapRange {
                inside: 0,
                outside: 165536,
                length: 65536
            }])
        );
        assert!(mapping.is_remapped());
    }

    #[test]
    fn root_to_root_partial_range_is_still_unremapped() {
        assert_eq!(parse_id_map("0 0 65536"), IdMapping::Unremapped);
    }

    #[test]
    fn empty_or_garbage_is_unparseable() {
        assert!(matches!(parse_id_map(""), IdMapping::Unparseable(_)));
        assert!(matches!(
            parse_id_map("exec format error"),
            IdMapping::Unparseable(_)
        ));
    }
}
