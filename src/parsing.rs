use anyhow::{anyhow, Result};
use std::iter::FromIterator;

pub type StringPair = (String, String);

/// Separator of the bootfs-datasets tag list. Reads and writes both use this
/// single character.
pub const TAG_SEPARATOR: char = ',';

pub fn parse_key_value_pair_lines<'a, T, U>(lines: T, seperator: &str) -> Result<U>
where
    T: Iterator<Item = &'a str>,
    U: FromIterator<StringPair>,
{
    lines
        .map(|s| parse_key_value_pair_line(s, seperator))
        .collect::<Result<U>>()
}

fn parse_key_value_pair_line(line: &str, seperator: &str) -> Result<StringPair> {
    let parts: Vec<&str> = line.splitn(2, seperator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("Invalid line in key value pair data.")),
    }
}

/// Last path element of a dataset name, the snapshot tag included if any.
pub fn base_name(name: &str) -> &str {
    name.rsplitn(2, '/').next().unwrap_or(name)
}

/// Pool a dataset belongs to: everything up to the first `/`.
pub fn pool_name(name: &str) -> &str {
    name.splitn(2, '/').next().unwrap_or(name)
}

/// Number of `/` separators. Parents always have a smaller depth than their
/// children, snapshots share the depth of their base dataset.
pub fn dataset_depth(name: &str) -> usize {
    name.matches('/').count()
}

/// Splits `dataset@tag` into its base dataset and snapshot tag.
pub fn split_snapshot_name(name: &str) -> Option<(&str, &str)> {
    let mut it = name.splitn(2, '@');
    match (it.next(), it.next()) {
        (Some(base), Some(tag)) if !tag.is_empty() => Some((base, tag)),
        _ => None,
    }
}

/// User datasets live under a `userdata` container anywhere in the tree.
pub fn is_user_dataset_name(name: &str) -> bool {
    name.to_lowercase().contains("/userdata/")
}

/// Clone suffix of a state id: the part of the base name after the last `_`.
pub fn state_suffix(id: &str) -> Result<&str> {
    let base = base_name(id);
    match base.rsplitn(2, '_').next() {
        Some(suffix) if suffix.len() < base.len() && !suffix.is_empty() => Ok(suffix),
        _ => Err(anyhow!("no suffix separator '_' in state id {}", id)),
    }
}

pub fn parse_tags(raw: &str) -> Vec<&str> {
    raw.split(TAG_SEPARATOR).filter(|t| !t.is_empty()).collect()
}

/// New tag list with `id` appended, or None when the list already holds it.
pub fn add_tag(raw: &str, id: &str) -> Option<String> {
    if parse_tags(raw).contains(&id) {
        return None;
    }
    if raw.is_empty() {
        Some(id.to_string())
    } else {
        Some(format!("{}{}{}", raw, TAG_SEPARATOR, id))
    }
}

/// New tag list with `id` dropped, or None when the list did not hold it.
pub fn remove_tag(raw: &str, id: &str) -> Option<String> {
    let tags = parse_tags(raw);
    if !tags.contains(&id) {
        return None;
    }
    Some(
        tags.into_iter()
            .filter(|t| *t != id)
            .collect::<Vec<_>>()
            .join(&TAG_SEPARATOR.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_helpers() {
        assert_eq!(base_name("rpool/ROOT/ubuntu_1234"), "ubuntu_1234");
        assert_eq!(base_name("rpool"), "rpool");
        assert_eq!(pool_name("rpool/ROOT/ubuntu_1234"), "rpool");
        assert_eq!(dataset_depth("rpool/ROOT/ubuntu_1234"), 2);
        assert_eq!(
            split_snapshot_name("rpool/ROOT/ubuntu_1234@snap1"),
            Some(("rpool/ROOT/ubuntu_1234", "snap1"))
        );
        assert_eq!(split_snapshot_name("rpool/ROOT/ubuntu_1234"), None);
        assert!(is_user_dataset_name("rpool/USERDATA/user1_abcdef"));
        assert!(!is_user_dataset_name("rpool/USERDATA"));
    }

    #[test]
    fn state_suffix_extraction() {
        assert_eq!(state_suffix("rpool/ROOT/ubuntu_4242").unwrap(), "4242");
        assert!(state_suffix("rpool/ROOT/ubuntu").is_err());
        assert!(state_suffix("rpool/ROOT/ubuntu_").is_err());
    }

    #[test]
    fn tag_list_grammar() {
        assert_eq!(add_tag("", "a").unwrap(), "a");
        assert_eq!(add_tag("a", "b").unwrap(), "a,b");
        assert_eq!(add_tag("a,b", "a"), None);
        assert_eq!(remove_tag("a,b", "a").unwrap(), "b");
        assert_eq!(remove_tag("a,b,c", "b").unwrap(), "a,c");
        assert_eq!(remove_tag("a", "a").unwrap(), "");
        assert_eq!(remove_tag("a,b", "z"), None);
    }
}
