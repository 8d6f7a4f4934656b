use std::collections::HashMap;
use std::io::Read as _;

// SVN dump file format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DumpVersion {
    Two,
    Three,
}

impl DumpVersion {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"2" => Some(Self::Two),
            b"3" => Some(Self::Three),
            _ => None,
        }
    }
}

pub(crate) enum Record {
    Uuid(uuid::Uuid),
    Rev(RevRecord),
    Node(NodeRecord),
}

pub(crate) struct RevRecord {
    pub(crate) rev_no: u32,
    /// In the order they appear in the dump.
    pub(crate) properties: Vec<(String, Vec<u8>)>,
}

pub(crate) struct NodeRecord {
    pub(crate) path: String,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: NodeAction,
    pub(crate) copy_from: Option<NodeCopyFrom>,
    pub(crate) text_delta_base_md5: Option<String>,
    pub(crate) properties: Option<NodeProperties>,
    pub(crate) text: Option<NodeText>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeAction {
    Change,
    Add,
    Delete,
    Replace,
}

impl NodeAction {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"change" => Some(Self::Change),
            b"add" => Some(Self::Add),
            b"delete" => Some(Self::Delete),
            b"replace" => Some(Self::Replace),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"file" => Some(Self::File),
            b"dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NodeCopyFrom {
    pub(crate) rev: u32,
    pub(crate) path: String,
}

#[derive(Debug)]
pub(crate) struct NodeProperties {
    pub(crate) is_delta: bool,
    /// `None` values are deletions, only present when `is_delta` is set.
    pub(crate) properties: Vec<(String, Option<Vec<u8>>)>,
}

#[derive(Debug)]
pub(crate) struct NodeText {
    pub(crate) is_delta: bool,
    pub(crate) len: u64,
}

fn parse_bool(s: &[u8]) -> Option<bool> {
    match s {
        b"true" => Some(true),
        b"false" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    BrokenHeader,
    InvalidVersion { version: Vec<u8> },
    MissingHeaderEntry { key: Vec<u8> },
    UnexpectedHeaderEntry { key: Vec<u8> },
    InvalidHeaderEntry { key: Vec<u8>, value: Vec<u8> },
    UnknownRecordType,
    MismatchedContentLen,
    BrokenProperties,
    NonUtf8PropertyName { name: Vec<u8> },
    NodeBeforeRevision,
    BrokenDelta(super::delta::DeltaError),
}

impl From<std::io::Error> for ReadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read source: {e}"),
            Self::BrokenHeader => write!(f, "broken header"),
            Self::InvalidVersion { ref version } => {
                write!(f, "invalid version: \"{}\"", version.escape_ascii())
            }
            Self::MissingHeaderEntry { ref key } => {
                write!(f, "missing header entry: \"{}\"", key.escape_ascii())
            }
            Self::UnexpectedHeaderEntry { ref key } => {
                write!(f, "unexpected header entry: \"{}\"", key.escape_ascii())
            }
            Self::InvalidHeaderEntry { ref key, ref value } => write!(
                f,
                "invalid value header entry \"{}\": \"{}\"",
                key.escape_ascii(),
                value.escape_ascii(),
            ),
            Self::UnknownRecordType => write!(f, "unknown record type"),
            Self::MismatchedContentLen => write!(f, "mismatched content length"),
            Self::BrokenProperties => write!(f, "broken properties"),
            Self::NonUtf8PropertyName { ref name } => {
                write!(f, "non UTF-8 property name: \"{}\"", name.escape_ascii())
            }
            Self::NodeBeforeRevision => write!(f, "node record before first revision record"),
            Self::BrokenDelta(ref e) => write!(f, "broken text delta: {e}"),
        }
    }
}

const UUID_KEY: &[u8] = b"UUID";
const REV_NO_KEY: &[u8] = b"Revision-number";
const NODE_PATH_KEY: &[u8] = b"Node-path";
const NODE_KIND_KEY: &[u8] = b"Node-kind";
const NODE_ACTION_KEY: &[u8] = b"Node-action";
const COPY_FROM_REV_KEY: &[u8] = b"Node-copyfrom-rev";
const COPY_FROM_PATH_KEY: &[u8] = b"Node-copyfrom-path";
const TEXT_DELTA_BASE_MD5_KEY: &[u8] = b"Text-delta-base-md5";
const PROP_DELTA_KEY: &[u8] = b"Prop-delta";
const TEXT_DELTA_KEY: &[u8] = b"Text-delta";
const PROP_CONTENT_LEN_KEY: &[u8] = b"Prop-content-length";
const TEXT_CONTENT_LEN_KEY: &[u8] = b"Text-content-length";
const CONTENT_LEN_KEY: &[u8] = b"Content-length";

pub(crate) struct DumpReader<'a> {
    source: &'a mut dyn std::io::BufRead,
    version: DumpVersion,
    rem_text_len: u64,
}

impl<'a> DumpReader<'a> {
    pub(crate) fn new(source: &'a mut dyn std::io::BufRead) -> Result<Self, ReadError> {
        let header = parse_header(source)?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        let version_key = b"SVN-fs-dump-format-version";
        let raw_version =
            header
                .get(version_key.as_slice())
                .ok_or_else(|| ReadError::MissingHeaderEntry {
                    key: version_key.to_vec(),
                })?;
        let version = DumpVersion::parse(raw_version).ok_or_else(|| ReadError::InvalidVersion {
            version: raw_version.clone(),
        })?;

        Ok(Self {
            source,
            version,
            rem_text_len: 0,
        })
    }

    #[inline]
    pub(crate) fn version(&self) -> DumpVersion {
        self.version
    }

    fn has_deltas(&self) -> bool {
        match self.version {
            DumpVersion::Two => false,
            DumpVersion::Three => true,
        }
    }

    pub(crate) fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        assert_eq!(
            self.rem_text_len, 0,
            "text stream has not been consumed yet",
        );

        let Some(header) = parse_header(self.source)? else {
            return Ok(None);
        };

        let raw_uuid = header.get(UUID_KEY);
        let raw_rev_no = header.get(REV_NO_KEY);
        let raw_node_path = header.get(NODE_PATH_KEY);

        let type_cnt = usize::from(raw_uuid.is_some())
            + usize::from(raw_rev_no.is_some())
            + usize::from(raw_node_path.is_some());
        if type_cnt != 1 {
            return Err(ReadError::UnknownRecordType);
        }

        if let Some(raw_uuid) = raw_uuid {
            if header_u64(&header, CONTENT_LEN_KEY)?.unwrap_or(0) != 0 {
                return Err(ReadError::MismatchedContentLen);
            }

            let uuid = uuid::Uuid::try_parse_ascii(raw_uuid).map_err(|_| {
                ReadError::InvalidHeaderEntry {
                    key: UUID_KEY.to_vec(),
                    value: raw_uuid.clone(),
                }
            })?;
            Ok(Some(Record::Uuid(uuid)))
        } else if let Some(raw_rev_no) = raw_rev_no {
            let rev_no = parse_u32(REV_NO_KEY, raw_rev_no)?;

            let prop_content_len = header_u64(&header, PROP_CONTENT_LEN_KEY)?;
            let content_len = header_u64(&header, CONTENT_LEN_KEY)?;
            if prop_content_len.unwrap_or(0) != content_len.unwrap_or(0) {
                return Err(ReadError::MismatchedContentLen);
            }

            let properties = match prop_content_len {
                Some(len) => self
                    .read_properties(len, false)?
                    .into_iter()
                    .filter_map(|(name, value)| Some((name, value?)))
                    .collect(),
                None => Vec::new(),
            };

            Ok(Some(Record::Rev(RevRecord { rev_no, properties })))
        } else if let Some(raw_node_path) = raw_node_path {
            let path = String::from_utf8(raw_node_path.clone()).map_err(|_| {
                ReadError::InvalidHeaderEntry {
                    key: NODE_PATH_KEY.to_vec(),
                    value: raw_node_path.clone(),
                }
            })?;

            let kind = header
                .get(NODE_KIND_KEY)
                .map(|raw| {
                    NodeKind::parse(raw).ok_or_else(|| ReadError::InvalidHeaderEntry {
                        key: NODE_KIND_KEY.to_vec(),
                        value: raw.clone(),
                    })
                })
                .transpose()?;

            let raw_action =
                header
                    .get(NODE_ACTION_KEY)
                    .ok_or_else(|| ReadError::MissingHeaderEntry {
                        key: NODE_ACTION_KEY.to_vec(),
                    })?;
            let action =
                NodeAction::parse(raw_action).ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: NODE_ACTION_KEY.to_vec(),
                    value: raw_action.clone(),
                })?;

            let copy_from = match (
                header.get(COPY_FROM_REV_KEY),
                header.get(COPY_FROM_PATH_KEY),
            ) {
                (None, None) => None,
                (Some(raw_rev), Some(raw_path)) => Some(NodeCopyFrom {
                    rev: parse_u32(COPY_FROM_REV_KEY, raw_rev)?,
                    path: parse_utf8(COPY_FROM_PATH_KEY, raw_path)?,
                }),
                (Some(_), None) => {
                    return Err(ReadError::MissingHeaderEntry {
                        key: COPY_FROM_PATH_KEY.to_vec(),
                    });
                }
                (None, Some(_)) => {
                    return Err(ReadError::MissingHeaderEntry {
                        key: COPY_FROM_REV_KEY.to_vec(),
                    });
                }
            };

            let text_delta_base_md5 = header
                .get(TEXT_DELTA_BASE_MD5_KEY)
                .map(|raw| parse_utf8(TEXT_DELTA_BASE_MD5_KEY, raw))
                .transpose()?;

            let prop_content_len = header_u64(&header, PROP_CONTENT_LEN_KEY)?;
            let text_content_len = header_u64(&header, TEXT_CONTENT_LEN_KEY)?;
            let content_len = header_u64(&header, CONTENT_LEN_KEY)?;

            let expected_content_len = prop_content_len
                .unwrap_or(0)
                .checked_add(text_content_len.unwrap_or(0))
                .ok_or(ReadError::MismatchedContentLen)?;
            if content_len.unwrap_or(0) != expected_content_len {
                return Err(ReadError::MismatchedContentLen);
            }

            let properties = prop_content_len
                .map(|len| {
                    let is_delta = self.delta_flag(&header, PROP_DELTA_KEY)?;
                    let properties = self.read_properties(len, is_delta)?;
                    Ok::<_, ReadError>(NodeProperties {
                        is_delta,
                        properties,
                    })
                })
                .transpose()?;

            let text = text_content_len
                .map(|len| {
                    let is_delta = self.delta_flag(&header, TEXT_DELTA_KEY)?;
                    self.rem_text_len = len;
                    Ok::<_, ReadError>(NodeText { is_delta, len })
                })
                .transpose()?;

            Ok(Some(Record::Node(NodeRecord {
                path,
                kind,
                action,
                copy_from,
                text_delta_base_md5,
                properties,
                text,
            })))
        } else {
            Err(ReadError::UnknownRecordType)
        }
    }

    /// `Prop-delta` and `Text-delta` are only allowed since version 3.
    fn delta_flag(&self, header: &RecordHeader, key: &[u8]) -> Result<bool, ReadError> {
        let Some(raw) = header.get(key) else {
            return Ok(false);
        };
        let flag = parse_bool(raw).ok_or_else(|| ReadError::InvalidHeaderEntry {
            key: key.to_vec(),
            value: raw.clone(),
        })?;
        if !self.has_deltas() {
            return Err(ReadError::UnexpectedHeaderEntry { key: key.to_vec() });
        }
        Ok(flag)
    }

    fn read_properties(
        &mut self,
        len: u64,
        is_delta: bool,
    ) -> Result<Vec<(String, Option<Vec<u8>>)>, ReadError> {
        let mut prop_stream = (&mut self.source).take(len);
        match parse_properties(&mut prop_stream, is_delta) {
            Ok(props) => {
                if prop_stream.limit() != 0 {
                    Err(ReadError::BrokenProperties)
                } else {
                    Ok(props)
                }
            }
            Err(ReadError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
                ) =>
            {
                Err(ReadError::BrokenProperties)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    pub(crate) fn remaining_text_len(&self) -> u64 {
        self.rem_text_len
    }

    /// Reads the text of the last node record. It must be consumed
    /// completely before asking for the next record.
    pub(crate) fn text_reader(&mut self) -> TextReader<'_, 'a> {
        TextReader { reader: self }
    }

    /// Discards whatever is left of the current node text.
    pub(crate) fn skip_text(&mut self) -> Result<(), std::io::Error> {
        std::io::copy(&mut self.text_reader(), &mut std::io::sink())?;
        Ok(())
    }
}

pub(crate) struct TextReader<'r, 'a> {
    reader: &'r mut DumpReader<'a>,
}

impl std::io::Read for TextReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let max_len = usize::try_from(self.reader.rem_text_len)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        if max_len == 0 {
            return Ok(0);
        }
        let n = self.reader.source.read(&mut buf[..max_len])?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        self.reader.rem_text_len -= n as u64;
        Ok(n)
    }
}

type RecordHeader = HashMap<Vec<u8>, Vec<u8>>;

fn parse_u32(key: &[u8], raw: &[u8]) -> Result<u32, ReadError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ReadError::InvalidHeaderEntry {
            key: key.to_vec(),
            value: raw.to_vec(),
        })
}

fn parse_utf8(key: &[u8], raw: &[u8]) -> Result<String, ReadError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ReadError::InvalidHeaderEntry {
        key: key.to_vec(),
        value: raw.to_vec(),
    })
}

fn header_u64(header: &RecordHeader, key: &[u8]) -> Result<Option<u64>, ReadError> {
    header
        .get(key)
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: key.to_vec(),
                    value: raw.clone(),
                })
        })
        .transpose()
}

fn parse_header(r: &mut dyn std::io::BufRead) -> Result<Option<RecordHeader>, ReadError> {
    let mut buf = Vec::new();
    r.read_until(b'\n', &mut buf)?;
    while buf == b"\n" {
        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }
    if buf.is_empty() {
        return Ok(None);
    }
    let mut map = HashMap::new();
    while buf != b"\n" {
        let line = buf.strip_suffix(b"\n").ok_or(ReadError::BrokenHeader)?;

        let sep_pos = line
            .windows(2)
            .position(|n| n == b": ")
            .ok_or(ReadError::BrokenHeader)?;
        map.insert(line[..sep_pos].to_vec(), line[(sep_pos + 2)..].to_vec());

        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }

    Ok(Some(map))
}

fn invalid_data() -> ReadError {
    ReadError::Io(std::io::Error::from(std::io::ErrorKind::InvalidData))
}

fn read_line<'b>(
    r: &mut dyn std::io::BufRead,
    buf: &'b mut Vec<u8>,
) -> Result<&'b [u8], ReadError> {
    buf.clear();
    r.read_until(b'\n', buf)?;
    buf.strip_suffix(b"\n")
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
}

fn read_len_prefixed(r: &mut dyn std::io::BufRead, len: &[u8]) -> Result<Vec<u8>, ReadError> {
    let len = std::str::from_utf8(len)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid_data)?;

    let mut data = vec![0; len];
    r.read_exact(&mut data)?;

    let mut tmp = [0];
    r.read_exact(&mut tmp)?;
    if tmp != *b"\n" {
        return Err(invalid_data());
    }
    Ok(data)
}

fn property_name(raw: Vec<u8>) -> Result<String, ReadError> {
    String::from_utf8(raw).map_err(|e| ReadError::NonUtf8PropertyName {
        name: e.into_bytes(),
    })
}

fn parse_properties(
    r: &mut dyn std::io::BufRead,
    is_delta: bool,
) -> Result<Vec<(String, Option<Vec<u8>>)>, ReadError> {
    let mut buf = Vec::new();
    let mut props = Vec::new();
    loop {
        let line = read_line(r, &mut buf)?;

        if line == b"PROPS-END" {
            break;
        }

        if let Some(key_len) = line.strip_prefix(b"K ") {
            let key = read_len_prefixed(r, key_len)?;

            let line = read_line(r, &mut buf)?;
            let value_len = line.strip_prefix(b"V ").ok_or_else(invalid_data)?;
            let value = read_len_prefixed(r, value_len)?;

            props.push((property_name(key)?, Some(value)));
        } else if let Some(key_len) = line.strip_prefix(b"D ") {
            if !is_delta {
                return Err(invalid_data());
            }
            let key = read_len_prefixed(r, key_len)?;
            props.push((property_name(key)?, None));
        } else {
            return Err(invalid_data());
        }
    }

    Ok(props)
}
