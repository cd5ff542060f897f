//! The mapper `CONTROL` wire format.
//!
//! A mapper reports one line per input file on its `CONTROL` stream:
//! `status,size,uri`, where `status` is `+` (processed) or `!` (failed),
//! `size` is the byte size of the downloaded file (`0` on failure), and
//! `uri` is the input string exactly as the mapper received it. Fields
//! are not escaped; the line is split exactly twice, so any further
//! commas belong to the URI tail.

use crate::prelude::*;

/// Did the mapper process the file, or fail on it?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlStatus {
    /// The file was downloaded and mapped successfully.
    Processed,
    /// Downloading or mapping failed; the file should be requeued.
    Failed,
}

impl ControlStatus {
    fn as_str(self) -> &'static str {
        match self {
            ControlStatus::Processed => "+",
            ControlStatus::Failed => "!",
        }
    }
}

/// One parsed `CONTROL` line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ControlRecord {
    /// What happened to the file.
    pub status: ControlStatus,
    /// The byte size of the file, or `0` on failure.
    pub size: u64,
    /// The input URI, verbatim.
    pub uri: String,
}

impl ControlRecord {
    /// A success record for `uri`.
    pub fn processed(size: u64, uri: &str) -> ControlRecord {
        ControlRecord {
            status: ControlStatus::Processed,
            size,
            uri: uri.to_owned(),
        }
    }

    /// A per-file failure record for `uri`.
    pub fn failed(uri: &str) -> ControlRecord {
        ControlRecord {
            status: ControlStatus::Failed,
            size: 0,
            uri: uri.to_owned(),
        }
    }

    /// Parse one `CONTROL` line (without its trailing line break).
    pub fn parse(line: &str) -> Result<ControlRecord> {
        let mut fields = line.splitn(3, ',');
        let status = match fields.next() {
            Some("+") => ControlStatus::Processed,
            Some("!") => ControlStatus::Failed,
            _ => return Err(format_err!("invalid control status in {:?}", line)),
        };
        let size = fields
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| format_err!("invalid control size in {:?}", line))?;
        let uri = fields
            .next()
            .ok_or_else(|| format_err!("missing uri in control line {:?}", line))?;
        if uri.is_empty() {
            return Err(format_err!("missing uri in control line {:?}", line));
        }
        Ok(ControlRecord {
            status,
            size,
            uri: uri.to_owned(),
        })
    }
}

impl fmt::Display for ControlRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.status.as_str(), self.size, self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_and_failure() {
        assert_eq!(
            ControlRecord::parse("+,1024,s3://bucket/key").unwrap(),
            ControlRecord::processed(1024, "s3://bucket/key"),
        );
        assert_eq!(
            ControlRecord::parse("!,0,file:///data/in.csv").unwrap(),
            ControlRecord::failed("file:///data/in.csv"),
        );
    }

    #[test]
    fn commas_in_uri_tail_are_preserved() {
        let record = ControlRecord::parse("+,7,s3://bucket/a,b,c").unwrap();
        assert_eq!(record.uri, "s3://bucket/a,b,c");
    }

    #[test]
    fn round_trips_through_display() {
        let record = ControlRecord::processed(42, "s3://bucket/weird,key");
        assert_eq!(
            ControlRecord::parse(&record.to_string()).unwrap(),
            record
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ControlRecord::parse("").is_err());
        assert!(ControlRecord::parse("?,0,uri").is_err());
        assert!(ControlRecord::parse("+,notanumber,uri").is_err());
        assert!(ControlRecord::parse("+,12").is_err());
        assert!(ControlRecord::parse("mapper aborted by signal").is_err());
    }
}
