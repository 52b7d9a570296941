//! `crypttab` parsing and the managed-entry rules.
//!
//! Every data line carries exactly four whitespace separated fields:
//! `<target name> <source device> <key file> <options>`. Only entries whose
//! source is a `UUID=` reference and whose key file lives under the vault
//! mount point are managed by cryptdrive.

use crate::error::{CryptdriveError, CryptdriveResult};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Key-file field value meaning "ask for a passphrase interactively".
pub const KEY_SENTINEL: &str = "none";

/// Source device reference of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// `UUID=<value>`; the value is stored lowercased.
    Uuid(String),
    /// Anything else (`/dev/sdb1`, `LABEL=...`, `PARTUUID=...`); never managed.
    Other(String),
}

impl SourceRef {
    fn parse(raw: &str) -> Self {
        match strip_prefix_case_insensitive(raw, "UUID=") {
            Some(uuid) if !uuid.trim().is_empty() => SourceRef::Uuid(uuid.trim().to_lowercase()),
            _ => SourceRef::Other(raw.to_string()),
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match self {
            SourceRef::Uuid(uuid) => Some(uuid),
            SourceRef::Other(_) => None,
        }
    }
}

/// One line of `/etc/crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub target_name: String,
    pub source: SourceRef,
    /// `None` when the key field is the `none` sentinel.
    pub key_file: Option<PathBuf>,
    pub options: Vec<String>,
    pub line: usize,
}

impl DeviceEntry {
    /// True when the entry's key file lives under `mount_point` and its source is a UUID.
    pub fn is_managed(&self, mount_point: &Path) -> bool {
        self.source.uuid().is_some() && self.managed_key_file(mount_point).is_some()
    }

    /// Key file path, when it is lexically located under `mount_point`.
    pub fn managed_key_file(&self, mount_point: &Path) -> Option<&Path> {
        let key = self.key_file.as_deref()?;
        let lexically_clean = key.is_absolute()
            && !key
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        (lexically_clean && key != mount_point && key.starts_with(mount_point)).then_some(key)
    }

    /// Explain why an entry is not managed, for operator-facing warnings.
    pub fn unmanaged_reason(&self, mount_point: &Path) -> Option<String> {
        if self.is_managed(mount_point) {
            return None;
        }
        if let SourceRef::Other(raw) = &self.source {
            return Some(format!("source `{raw}` is not a UUID= reference"));
        }
        Some(match &self.key_file {
            None => "uses an interactive passphrase (key file `none`)".to_string(),
            Some(key) => format!(
                "key file {} is not under {}",
                key.display(),
                mount_point.display()
            ),
        })
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// Read and parse the registry at `path`.
pub fn read_entries(path: &Path) -> CryptdriveResult<Vec<DeviceEntry>> {
    let contents = fs::read_to_string(path)?;
    parse_crypttab(path, &contents)
}

/// Parse a `crypttab` document. `origin` is only used in error messages.
pub fn parse_crypttab(origin: &Path, contents: &str) -> CryptdriveResult<Vec<DeviceEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in contents.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(parse_error(
                origin,
                line,
                format!("expected 4 fields, found {}", fields.len()),
            ));
        }

        let target_name = fields[0].to_string();
        if !seen.insert(target_name.clone()) {
            return Err(parse_error(
                origin,
                line,
                format!("duplicate target name `{target_name}`"),
            ));
        }

        let key_file = match fields[2] {
            KEY_SENTINEL => None,
            other => Some(PathBuf::from(other)),
        };

        entries.push(DeviceEntry {
            target_name,
            source: SourceRef::parse(fields[1]),
            key_file,
            options: fields[3]
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
            line,
        });
    }

    Ok(entries)
}

fn parse_error(origin: &Path, line: usize, reason: String) -> CryptdriveError {
    CryptdriveError::Parse {
        path: origin.to_path_buf(),
        line,
        reason,
    }
}

fn strip_prefix_case_insensitive<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .and_then(|_| value.get(prefix.len()..))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# <target name> <source device> <key file> <options>

data    UUID=0A1B2C3D-aaaa-bbbb-cccc-000000000001  /mnt/keys/data.key  luks,noauto
backup  uuid=0a1b2c3d-aaaa-bbbb-cccc-000000000002  none                luks
   # indented comment
scratch /dev/sdc1                                  /mnt/keys/scratch.key luks
";

    fn parse(contents: &str) -> CryptdriveResult<Vec<DeviceEntry>> {
        parse_crypttab(Path::new("/etc/crypttab"), contents)
    }

    #[test]
    fn parses_entries_in_order() {
        let entries = parse(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].target_name, "data");
        assert_eq!(
            entries[0].source,
            SourceRef::Uuid("0a1b2c3d-aaaa-bbbb-cccc-000000000001".into())
        );
        assert_eq!(
            entries[0].key_file.as_deref(),
            Some(Path::new("/mnt/keys/data.key"))
        );
        assert_eq!(entries[0].options, vec!["luks", "noauto"]);
        assert_eq!(entries[0].line, 3);

        assert_eq!(entries[1].key_file, None);
        assert!(entries[1].source.uuid().is_some());
        assert_eq!(entries[2].source, SourceRef::Other("/dev/sdc1".into()));
    }

    #[test]
    fn managed_requires_uuid_and_key_under_mount_point() {
        let entries = parse(SAMPLE).unwrap();
        let mount = Path::new("/mnt/keys");
        assert!(entries[0].is_managed(mount));
        assert!(!entries[1].is_managed(mount));
        assert!(!entries[2].is_managed(mount));

        assert!(entries[1]
            .unmanaged_reason(mount)
            .unwrap()
            .contains("interactive passphrase"));
        assert!(entries[2]
            .unmanaged_reason(mount)
            .unwrap()
            .contains("not a UUID"));
        assert!(entries[0].unmanaged_reason(mount).is_none());
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let entries =
            parse("data UUID=1234 /mnt/keys-other/data.key luks\nup UUID=5678 /mnt/keys/../etc/key luks\n")
                .unwrap();
        let mount = Path::new("/mnt/keys");
        assert!(!entries[0].is_managed(mount));
        assert!(!entries[1].is_managed(mount));
    }

    #[test]
    fn wrong_field_count_is_fatal() {
        let err = parse("data UUID=1234 /mnt/keys/data.key\n").unwrap_err();
        match err {
            CryptdriveError::Parse { line, reason, .. } => {
                assert_eq!(line, 1);
                assert!(reason.contains("found 3"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_are_fatal() {
        let err =
            parse("data UUID=1 /mnt/keys/a luks\ndata UUID=2 /mnt/keys/b luks\n").unwrap_err();
        assert!(matches!(err, CryptdriveError::Parse { line: 2, .. }));
    }

    #[test]
    fn empty_registry_yields_no_entries() {
        assert!(parse("\n# nothing here\n").unwrap().is_empty());
    }
}
