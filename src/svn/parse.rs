use std::io::Read;

use super::delta::WindowReader;
use super::dump::{DumpReader, NodeRecord, ReadError, Record};

/// Returned when the cancellation check fires between records.
#[derive(Debug)]
pub(crate) struct Cancelled;

/// Receives the contents of a dump stream, in stream order.
///
/// For each revision: `new_revision_record`, its revision properties, then
/// for each node `new_node_record`, property events, at most one text
/// event and `close_node`. `close_revision` ends the revision.
pub(crate) trait DumpHandler {
    type Error: From<ReadError> + From<Cancelled>;

    fn uuid_record(&mut self, uuid: &uuid::Uuid) -> Result<(), Self::Error>;

    fn new_revision_record(&mut self, rev: u32) -> Result<(), Self::Error>;

    fn set_revision_property(&mut self, name: &str, value: &[u8]) -> Result<(), Self::Error>;

    /// `properties` and `text` of `node` are delivered through the other
    /// callbacks.
    fn new_node_record(&mut self, node: &NodeRecord) -> Result<(), Self::Error>;

    fn set_node_property(&mut self, name: &str, value: &[u8]) -> Result<(), Self::Error>;

    fn delete_node_property(&mut self, name: &str) -> Result<(), Self::Error>;

    /// The node carries a full property list that replaces the previous one.
    fn remove_node_props(&mut self) -> Result<(), Self::Error>;

    fn set_fulltext(&mut self, text: &mut dyn Read) -> Result<(), Self::Error>;

    fn apply_textdelta(
        &mut self,
        windows: &mut WindowReader<&mut dyn Read>,
    ) -> Result<(), Self::Error>;

    fn close_node(&mut self) -> Result<(), Self::Error>;

    fn close_revision(&mut self) -> Result<(), Self::Error>;
}

/// Feeds every record of `reader` to `handler`. `cancel` is polled before
/// each record.
pub(crate) fn parse_dumpstream<H: DumpHandler>(
    reader: &mut DumpReader<'_>,
    handler: &mut H,
    cancel: &dyn Fn() -> bool,
) -> Result<(), H::Error> {
    let mut in_revision = false;

    loop {
        if cancel() {
            return Err(Cancelled.into());
        }

        let Some(record) = reader.next_record()? else {
            break;
        };

        match record {
            Record::Uuid(uuid) => handler.uuid_record(&uuid)?,
            Record::Rev(rev_record) => {
                if in_revision {
                    handler.close_revision()?;
                }
                handler.new_revision_record(rev_record.rev_no)?;
                in_revision = true;
                for (name, value) in rev_record.properties.iter() {
                    handler.set_revision_property(name, value)?;
                }
            }
            Record::Node(node_record) => {
                if !in_revision {
                    return Err(ReadError::NodeBeforeRevision.into());
                }
                handle_node(reader, handler, &node_record)?;
            }
        }
    }

    if in_revision {
        handler.close_revision()?;
    }

    Ok(())
}

fn handle_node<H: DumpHandler>(
    reader: &mut DumpReader<'_>,
    handler: &mut H,
    node_record: &NodeRecord,
) -> Result<(), H::Error> {
    handler.new_node_record(node_record)?;

    if let Some(ref props) = node_record.properties {
        if !props.is_delta {
            handler.remove_node_props()?;
        }
        for (name, value) in props.properties.iter() {
            match value {
                Some(value) => handler.set_node_property(name, value)?,
                None => handler.delete_node_property(name)?,
            }
        }
    }

    if let Some(ref text) = node_record.text {
        let mut text_reader = reader.text_reader();
        if text.is_delta {
            let mut windows = WindowReader::new(&mut text_reader as &mut dyn Read);
            handler.apply_textdelta(&mut windows)?;
        } else {
            handler.set_fulltext(&mut text_reader)?;
        }
        // The handler may stop early, e.g. after the end-of-delta marker.
        reader.skip_text().map_err(ReadError::Io)?;
    }

    handler.close_node()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::{Cancelled, DumpHandler, parse_dumpstream};
    use crate::svn::delta::WindowReader;
    use crate::svn::dump::{DumpReader, NodeRecord, ReadError};

    #[derive(Debug)]
    enum TestError {
        Read,
        Cancelled,
    }

    impl From<ReadError> for TestError {
        fn from(_: ReadError) -> Self {
            Self::Read
        }
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            Self::Cancelled
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl DumpHandler for Recorder {
        type Error = TestError;

        fn uuid_record(&mut self, uuid: &uuid::Uuid) -> Result<(), TestError> {
            self.events.push(format!("uuid {uuid}"));
            Ok(())
        }

        fn new_revision_record(&mut self, rev: u32) -> Result<(), TestError> {
            self.events.push(format!("rev {rev}"));
            Ok(())
        }

        fn set_revision_property(&mut self, name: &str, value: &[u8]) -> Result<(), TestError> {
            self.events
                .push(format!("revprop {name}={}", value.escape_ascii()));
            Ok(())
        }

        fn new_node_record(&mut self, node: &NodeRecord) -> Result<(), TestError> {
            self.events.push(format!("node {}", node.path));
            Ok(())
        }

        fn set_node_property(&mut self, name: &str, value: &[u8]) -> Result<(), TestError> {
            self.events
                .push(format!("prop {name}={}", value.escape_ascii()));
            Ok(())
        }

        fn delete_node_property(&mut self, name: &str) -> Result<(), TestError> {
            self.events.push(format!("delprop {name}"));
            Ok(())
        }

        fn remove_node_props(&mut self) -> Result<(), TestError> {
            self.events.push("remove props".into());
            Ok(())
        }

        fn set_fulltext(&mut self, text: &mut dyn Read) -> Result<(), TestError> {
            let mut data = Vec::new();
            text.read_to_end(&mut data).map_err(ReadError::Io)?;
            self.events
                .push(format!("fulltext {}", data.escape_ascii()));
            Ok(())
        }

        fn apply_textdelta(
            &mut self,
            windows: &mut WindowReader<&mut dyn Read>,
        ) -> Result<(), TestError> {
            let mut count = 0;
            while windows
                .next_window()
                .map_err(ReadError::BrokenDelta)?
                .is_some()
            {
                count += 1;
            }
            self.events.push(format!("delta windows={count}"));
            Ok(())
        }

        fn close_node(&mut self) -> Result<(), TestError> {
            self.events.push("close node".into());
            Ok(())
        }

        fn close_revision(&mut self) -> Result<(), TestError> {
            self.events.push("close rev".into());
            Ok(())
        }
    }

    const DUMP: &[u8] = b"SVN-fs-dump-format-version: 3\n\n\
        UUID: 6a1c3f8e-3b38-4f0e-8d4b-3a1f2e6f7c10\n\n\
        Revision-number: 0\n\
        Prop-content-length: 10\n\
        Content-length: 10\n\n\
        PROPS-END\n\n\
        Revision-number: 1\n\
        Prop-content-length: 30\n\
        Content-length: 30\n\n\
        K 7\nsvn:log\nV 3\nmsg\nPROPS-END\n\n\
        Node-path: dir\n\
        Node-kind: dir\n\
        Node-action: add\n\
        Prop-content-length: 10\n\
        Content-length: 10\n\n\
        PROPS-END\n\n\
        Node-path: dir/f\n\
        Node-kind: file\n\
        Node-action: add\n\
        Text-content-length: 3\n\
        Content-length: 3\n\n\
        abc\n\n\
        Node-path: dir/g\n\
        Node-kind: file\n\
        Node-action: change\n\
        Prop-delta: true\n\
        Text-delta: true\n\
        Prop-content-length: 16\n\
        Text-content-length: 11\n\
        Content-length: 27\n\n\
        D 1\nx\nPROPS-END\n\
        SVN\x00\x00\x00\x01\x01\x01\x81z\n\n";

    #[test]
    fn test_callback_order() {
        let mut src = DUMP;
        let mut reader = DumpReader::new(&mut src).unwrap();
        let mut recorder = Recorder::default();
        parse_dumpstream(&mut reader, &mut recorder, &|| false).unwrap();

        assert_eq!(
            recorder.events,
            [
                "uuid 6a1c3f8e-3b38-4f0e-8d4b-3a1f2e6f7c10",
                "rev 0",
                "close rev",
                "rev 1",
                "revprop svn:log=msg",
                "node dir",
                "remove props",
                "close node",
                "node dir/f",
                "fulltext abc",
                "close node",
                "node dir/g",
                "delprop x",
                "delta windows=1",
                "close node",
                "close rev",
            ],
        );
    }

    #[test]
    fn test_cancel() {
        let mut src = DUMP;
        let mut reader = DumpReader::new(&mut src).unwrap();
        let mut recorder = Recorder::default();
        let r = parse_dumpstream(&mut reader, &mut recorder, &|| true);
        assert!(matches!(r, Err(TestError::Cancelled)));
        assert!(recorder.events.is_empty());
    }

    #[test]
    fn test_node_before_revision() {
        let dump = b"SVN-fs-dump-format-version: 2\n\n\
            Node-path: a\n\
            Node-action: delete\n\n";
        let mut src = dump.as_slice();
        let mut reader = DumpReader::new(&mut src).unwrap();
        let mut recorder = Recorder::default();
        let r = parse_dumpstream(&mut reader, &mut recorder, &|| false);
        assert!(matches!(r, Err(TestError::Read)));
    }
}
