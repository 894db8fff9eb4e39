//! Parser for the device's `stat -f` output.
//!
//! The output is whitespace-tokenized. Keys end with `:`; a key that does
//! not yet end with `:` is a multi-word key still being assembled ("Block
//! size" becomes "Blocksize"). `Blocks:` and `Inodes:` carry no value of
//! their own; they scope the `Total`/`Free`/`Available` keys that follow.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatfsParseError {
    #[error("no output")]
    NoOutput,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl From<StatfsParseError> for crate::error::FsError {
    fn from(err: StatfsParseError) -> Self {
        // Unparseable device output is an unexpected I/O-class failure.
        crate::error::FsError::Io(std::io::Error::other(err))
    }
}

/// Filesystem totals as reported by the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatfsInfo {
    pub namelen: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

pub fn parse_statfs(output: &str) -> Result<StatfsInfo, StatfsParseError> {
    if output.is_empty() {
        return Err(StatfsParseError::NoOutput);
    }

    let mut info = StatfsInfo::default();
    let mut scope = String::new();
    let mut key = String::new();

    for token in output.split_whitespace() {
        if !key.ends_with(':') {
            // Multi-word key still being assembled.
            key.push_str(token);
            continue;
        }
        if token.ends_with(':') {
            // The previous key was a scope prefix (Blocks, Inodes).
            scope = key.trim_end_matches(':').to_string();
            key = token.to_string();
            continue;
        }

        let value = token;
        let name = key.trim_end_matches(':').to_string();

        let recognized = matches!(
            name.as_str(),
            "Namelen" | "Blocksize" | "Total" | "Free" | "Available"
        );
        if recognized {
            let parsed: u64 =
                value
                    .parse()
                    .map_err(|_| StatfsParseError::InvalidValue {
                        key: name.clone(),
                        value: value.to_string(),
                    })?;
            match (scope.as_str(), name.as_str()) {
                (_, "Namelen") => info.namelen = parsed as u32,
                (_, "Blocksize") => info.bsize = parsed as u32,
                ("Blocks", "Total") => info.blocks = parsed,
                ("Blocks", "Free") => info.bfree = parsed,
                ("Blocks", "Available") => info.bavail = parsed,
                ("Inodes", "Total") => info.files = parsed,
                ("Inodes", "Free") => info.ffree = parsed,
                _ => {}
            }
        }
        // Other keys (File, ID, Type) are ignored.

        key.clear();
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
File: \"/sdcard/Pictures\"
ID: 0        Namelen: 255     Type: UNKNOWN
Block size: 4096
Blocks: Total: 1269664    Free: 1209578    Available: 1205482
Inodes: Total: 327680     Free: 326438
";

    #[test]
    fn parses_full_sample() {
        let info = parse_statfs(SAMPLE).unwrap();
        assert_eq!(
            info,
            StatfsInfo {
                namelen: 255,
                bsize: 4096,
                blocks: 1_269_664,
                bfree: 1_209_578,
                bavail: 1_205_482,
                files: 327_680,
                ffree: 326_438,
            }
        );
    }

    #[test]
    fn empty_output_is_an_error() {
        assert_eq!(parse_statfs(""), Err(StatfsParseError::NoOutput));
        assert_eq!(parse_statfs("").unwrap_err().to_string(), "no output");
    }

    #[test]
    fn non_integer_value_is_an_error() {
        let err = parse_statfs("Namelen: a").unwrap_err();
        assert_eq!(err.to_string(), "invalid value for Namelen: a");
    }

    #[test]
    fn multi_word_key_is_concatenated() {
        let info = parse_statfs("Block size: 512").unwrap();
        assert_eq!(info.bsize, 512);
    }

    #[test]
    fn scope_prefix_distinguishes_totals() {
        let info = parse_statfs("Blocks: Total: 10\nInodes: Total: 20").unwrap();
        assert_eq!(info.blocks, 10);
        assert_eq!(info.files, 20);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let info = parse_statfs("Type: UNKNOWN Namelen: 64").unwrap();
        assert_eq!(info.namelen, 64);
    }

    #[test]
    fn quoted_file_value_is_ignored() {
        let info = parse_statfs("File: \"/sdcard\"\nNamelen: 128").unwrap();
        assert_eq!(info.namelen, 128);
    }
}
