use std::collections::BTreeMap;

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Test {
    #[serde(rename = "dump-source", default = "dump_source_uncompressed")]
    pub(crate) dump_source: DumpSource,
    #[serde(rename = "dump-version", default = "dump_version_2")]
    pub(crate) dump_version: DumpVersion,
    pub(crate) uuid: Option<String>,
    /// Properties of revision 0, which is always written.
    #[serde(rename = "rev0-props", default = "BTreeMap::new")]
    pub(crate) rev0_props: BTreeMap<String, String>,
    pub(crate) revs: Vec<Rev>,
    /// Contents of the parameters file, none is passed when missing.
    pub(crate) params: Option<String>,
    #[serde(rename = "failed", default = "false_")]
    pub(crate) failed: bool,
    pub(crate) logs: Option<String>,
    /// Revisions reported as loaded on stdout.
    pub(crate) loaded: Option<Vec<u32>>,
    /// Expected contents of the head revision.
    pub(crate) tree: Option<BTreeMap<String, TreeEntry>>,
}

#[derive(serde::Deserialize)]
pub(crate) enum DumpSource {
    #[serde(rename = "uncompressed")]
    Uncompressed,
    #[serde(rename = "compressed-gzip")]
    CompressedGzip,
    #[serde(rename = "compressed-bzip2")]
    CompressedBzip2,
    #[serde(rename = "compressed-xz")]
    CompressedXz,
    #[serde(rename = "compressed-zstd")]
    CompressedZstd,
    #[serde(rename = "compressed-lz4")]
    CompressedLz4,
}

#[inline(always)]
fn dump_source_uncompressed() -> DumpSource {
    DumpSource::Uncompressed
}

#[derive(serde::Deserialize)]
pub(crate) enum DumpVersion {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
}

#[inline(always)]
fn dump_version_2() -> DumpVersion {
    DumpVersion::Two
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Rev {
    pub(crate) no: Option<u32>,
    #[serde(default = "BTreeMap::new")]
    pub(crate) props: BTreeMap<String, Bytes>,
    #[serde(default = "Vec::new")]
    pub(crate) nodes: Vec<Node>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Node {
    pub(crate) path: String,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: NodeAction,
    #[serde(rename = "copy-from-path")]
    pub(crate) copy_from_path: Option<String>,
    #[serde(rename = "copy-from-rev")]
    pub(crate) copy_from_rev: Option<u32>,
    #[serde(rename = "prop-delta")]
    pub(crate) prop_delta: Option<bool>,
    #[serde(rename = "text-delta")]
    pub(crate) text_delta: Option<bool>,
    pub(crate) props: Option<BTreeMap<String, Option<String>>>,
    pub(crate) text: Option<Bytes>,
}

#[derive(serde::Deserialize)]
pub(crate) enum NodeKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Dir,
}

#[derive(serde::Deserialize)]
pub(crate) enum NodeAction {
    #[serde(rename = "change")]
    Change,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "replace")]
    Replace,
}

#[derive(serde::Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub(crate) enum TreeEntry {
    #[serde(rename = "file")]
    File { data: String },
    #[serde(rename = "dir")]
    Dir,
}

/// Raw bytes, written in YAML as a string or as a sequence of numbers.
pub(crate) struct Bytes(Vec<u8>);

impl std::ops::Deref for Bytes {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl<'de> serde::Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(BytesVisitor).map(Self)
    }
}

struct BytesVisitor;

impl<'de> serde::de::Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("a string or byte array")
    }

    fn visit_str<E>(self, v: &str) -> Result<Vec<u8>, E>
    where
        E: serde::de::Error,
    {
        Ok(v.as_bytes().to_vec())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}

#[inline(always)]
fn false_() -> bool {
    false
}
