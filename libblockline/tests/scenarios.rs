//! End-to-end behavior of loaded and streaming handles.

use std::cell::Cell;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use libblockline::{
    Blockline, Diagnostic, Error, Introspect, Mode, TypeErrorKind, Value,
};

type Handle = Blockline<Cursor<Vec<u8>>>;

/// Open `src` in both modes, scanning the streaming handle.
fn both(src: &str) -> [(&'static str, Handle); 2] {
    let loaded = Blockline::open(Cursor::new(src.as_bytes().to_vec()), Mode::Loaded).unwrap();
    let mut streaming =
        Blockline::open(Cursor::new(src.as_bytes().to_vec()), Mode::Streaming).unwrap();
    streaming.scan().unwrap();
    [("loaded", loaded), ("streaming", streaming)]
}

/// Reader that tallies the bytes pulled from its source.
struct Counting<R> {
    inner: R,
    read: Rc<Cell<u64>>,
}

impl<R> Counting<R> {
    fn new(inner: R) -> (Self, Rc<Cell<u64>>) {
        let read = Rc::new(Cell::new(0));
        (
            Self {
                inner,
                read: Rc::clone(&read),
            },
            read,
        )
    }
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read.set(self.read.get() + n as u64);
        Ok(n)
    }
}

impl<R: Seek> Seek for Counting<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn keyed_document(keys: usize) -> String {
    let mut src = String::from("@ keys\n");
    for i in 0..keys {
        src.push_str(&format!(": k{:05} = value {}\n", i, i));
    }
    src
}

fn strings(items: &[&str]) -> Value {
    Value::Array(items.iter().map(|s| Value::from(*s)).collect())
}

#[test]
fn test_untyped_top_level_pair() {
    for (mode, doc) in both("= version = 0.2\n") {
        assert_eq!(doc.get("main/version").unwrap(), Some(Value::from("0.2")), "{}", mode);
        assert_eq!(
            doc.get_as("main/version", Introspect::Type).unwrap(),
            Some(Value::from("string")),
            "{}",
            mode
        );
    }
}

#[test]
fn test_section_entry() {
    for (mode, doc) in both("@ headers\n: H1 = Exclude\n") {
        assert_eq!(
            doc.get("main/headers/H1").unwrap(),
            Some(Value::from("Exclude")),
            "{}",
            mode
        );
        assert_eq!(
            doc.get_as("main/headers/H1", Introspect::Type).unwrap(),
            Some(Value::from("string")),
            "{}",
            mode
        );
        assert_eq!(doc.get_as("main/headers", Introspect::Type).unwrap(), Some(Value::from("mapping")));
    }
}

#[test]
fn test_row_reference_to_later_block() {
    let src = "@ segments\n, & id2\n> id2\n@\n, H1, mouse\n< id2\n";
    for (mode, doc) in both(src) {
        assert_eq!(
            doc.get("main/segments/0").unwrap(),
            Some(strings(&["H1", "mouse"])),
            "{}",
            mode
        );
        assert_eq!(doc.get("main/segments/0/1").unwrap(), Some(Value::from("mouse")));
        assert!(doc.diagnostics().is_empty(), "{}", mode);
    }
}

#[test]
fn test_unresolved_reference_is_absent() {
    for (mode, doc) in both("= a = 1\n@ list\n- & nowhere\n") {
        assert_eq!(doc.get("main/list/0").unwrap(), None, "{}", mode);
        assert!(!doc.has("main/list/0").unwrap(), "{}", mode);
        assert!(!doc.has("main/list/0/x").unwrap(), "{}", mode);
        assert!(doc.has("main/list").unwrap(), "{}", mode);
        assert!(
            doc.diagnostics().iter().any(|d| matches!(
                d,
                Diagnostic::Unresolved { target, .. } if target == "nowhere"
            )),
            "{}: {:?}",
            mode,
            doc.diagnostics()
        );
    }
}

#[test]
fn test_hinted_scalar_keeps_raw() {
    for (mode, doc) in both("- (int) 1\n") {
        assert_eq!(doc.get("main/0").unwrap(), Some(Value::from(1i64)), "{}", mode);
        assert_eq!(doc.get_as("main/0", Introspect::Raw).unwrap(), Some(Value::from("1")));
        assert_eq!(doc.get_as("main/0", Introspect::Type).unwrap(), Some(Value::from("int")));
    }
}

#[test]
fn test_composed_type_constraint() {
    let src = "> types\n(address) = (int=0-99) (string=2-10) (string=2.)\n< types\n\
               , (address) 150, Elm, Shelbyville\n";
    for (mode, doc) in both(src) {
        let meta = doc.meta("main/0/0").unwrap().unwrap();
        let error = meta.error.expect("field error");
        assert_eq!(error.kind, TypeErrorKind::Constraint, "{}", mode);
        assert_eq!(error.field, Some(0));
        assert!(error.expected.contains("0-99"), "{}", error.expected);
        assert_eq!(meta.raw.as_deref(), Some("150"));
        assert_eq!(doc.get("main/0/0").unwrap(), Some(Value::from("150")));
        assert_eq!(doc.get("main/0/1").unwrap(), Some(Value::from("Elm")));
        assert_eq!(
            doc.get_as("main/0", Introspect::Type).unwrap(),
            Some(Value::from("address"))
        );
        assert!(doc.diagnostics().iter().any(|d| matches!(
            d,
            Diagnostic::Type { path, error } if path == "main/0/0" && error.field == Some(0)
        )));
    }
}

#[test]
fn test_row_arity_error() {
    let src = "> types\n(pair) = (int) (int)\n< types\n, (pair) 1, 2, 3\n";
    for (mode, doc) in both(src) {
        let error = doc.meta("main/0").unwrap().unwrap().error.expect("arity error");
        assert_eq!(error.kind, TypeErrorKind::Arity, "{}", mode);
        assert_eq!(doc.get("main/0/2").unwrap(), Some(Value::from("3")));
    }
}

#[test]
fn test_second_scan_is_a_no_op() {
    let src = "= a = 1\n";
    let mut doc = Blockline::open(Cursor::new(src.as_bytes().to_vec()), Mode::Streaming).unwrap();
    doc.scan().unwrap();
    let first = doc.index().unwrap().len();
    doc.scan().unwrap();
    assert_eq!(doc.index().unwrap().len(), first);
    assert_eq!(doc.get("main/a").unwrap(), Some(Value::from("1")));
}

#[test]
fn test_reopened_block_and_forward_reference() {
    let src = "> later\n- one\n< later\n= ref = & later\n> later\n- two\n< later\n";
    for (mode, doc) in both(src) {
        assert_eq!(doc.get("main/ref").unwrap(), Some(strings(&["one", "two"])), "{}", mode);
        assert_eq!(doc.get("main/ref/1").unwrap(), Some(Value::from("two")));
    }
}

#[test]
fn test_streaming_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "@ config\n: port = (int) 8080 # default\n: host = localhost\n> extra\n- (bool) true\n< extra\n"
    )
    .unwrap();
    let mut doc = Blockline::open(file.reopen().unwrap(), Mode::Streaming).unwrap();
    assert_eq!(doc.get("main/config/port").unwrap(), None);
    doc.scan().unwrap();
    assert_eq!(doc.get("main/config/port").unwrap(), Some(Value::from(8080i64)));
    assert_eq!(
        doc.get_as("main/config/port", Introspect::Comment).unwrap(),
        Some(Value::from("default"))
    );
    assert_eq!(doc.get("extra/0").unwrap(), Some(Value::Bool(true)));
    assert_eq!(doc.require("main/config/host").unwrap(), Value::from("localhost"));
}

#[test]
fn test_cast_failure_keeps_raw_text() {
    for (mode, doc) in both("= n = (int) twelve\n") {
        assert_eq!(doc.get("main/n").unwrap(), Some(Value::from("twelve")), "{}", mode);
        let meta = doc.meta("main/n").unwrap().unwrap();
        assert_eq!(meta.error.map(|e| e.kind), Some(TypeErrorKind::Cast));
        assert_eq!(doc.diagnostics().len(), 1);
    }
}

#[test]
fn test_unclosed_block_diagnostic() {
    for (mode, doc) in both("= a = 1\n> open\n- x\n") {
        assert_eq!(
            doc.diagnostics(),
            &[Diagnostic::UnclosedBlock {
                id: "open".into(),
                line: 2
            }],
            "{}",
            mode
        );
        assert_eq!(doc.get("open/0").unwrap(), Some(Value::from("x")));
    }
}

#[test]
fn test_require_and_malformed_paths() {
    for (mode, doc) in both("= a = 1\n") {
        assert!(matches!(doc.require("main/b"), Err(Error::MissingPath(_))), "{}", mode);
        assert!(matches!(doc.get("main//a"), Err(Error::MalformedPath { .. })));
        assert!(matches!(doc.has(""), Err(Error::MalformedPath { .. })));
        assert_eq!(doc.get("nosuchblock").unwrap(), None);
    }
}

#[test]
fn test_escaped_key_path() {
    for (mode, doc) in both("= a/b = slash\n= 50% = half\n") {
        assert_eq!(doc.get("main/a%2Fb").unwrap(), Some(Value::from("slash")), "{}", mode);
        assert_eq!(doc.get("main/50%25").unwrap(), Some(Value::from("half")), "{}", mode);
    }
}

#[test]
fn test_spans_agree_between_modes() {
    let src = "@ s\n: k = (float) 1.5 # c\n";
    let [(_, loaded), (_, streaming)] = both(src);
    for path in ["main", "main/s", "main/s/k"] {
        assert_eq!(loaded.meta(path).unwrap(), streaming.meta(path).unwrap(), "{}", path);
    }
    assert_eq!(
        loaded.get_as("main/s/k", Introspect::Span).unwrap(),
        Some(Value::Array(vec![Value::from(18i64), Value::from(21i64)]))
    );
}

#[test]
fn test_query_after_scan_reads_one_line() {
    let src = keyed_document(5000);
    let (reader, read) = Counting::new(Cursor::new(src.clone().into_bytes()));
    let mut doc = Blockline::open(reader, Mode::Streaming).unwrap();
    assert_eq!(read.get(), 0);
    doc.scan().unwrap();
    assert_eq!(read.get(), src.len() as u64);

    let line = ": k02500 = value 2500".len() as u64;
    read.set(0);
    assert_eq!(doc.get("main/keys/k02500").unwrap(), Some(Value::from("value 2500")));
    assert_eq!(read.get(), line);

    read.set(0);
    let meta = doc.meta("main/keys/k02500").unwrap().unwrap();
    assert_eq!(meta.raw.as_deref(), Some("value 2500"));
    assert_eq!(read.get(), line);

    read.set(0);
    assert!(doc.has("main/keys/k02500").unwrap());
    assert!(!doc.has("main/keys/k99999").unwrap());
    assert_eq!(doc.meta("main/keys").unwrap().unwrap().type_tag, "mapping");
    assert_eq!(read.get(), 0);
}

#[test]
fn test_open_rewinds_a_consumed_source() {
    let src = "= first = 1\n= second = 2\n";
    for mode in [Mode::Loaded, Mode::Streaming] {
        let mut cursor = Cursor::new(src.as_bytes().to_vec());
        let mut skipped = [0u8; 12];
        cursor.read_exact(&mut skipped).unwrap();
        assert_eq!(cursor.position(), 12);

        let mut doc = Blockline::open(cursor, mode).unwrap();
        doc.scan().unwrap();
        assert_eq!(doc.get("main/first").unwrap(), Some(Value::from("1")), "{:?}", mode);
        assert_eq!(doc.get("main/second").unwrap(), Some(Value::from("2")), "{:?}", mode);
    }

    let mut cursor = Cursor::new(src.as_bytes().to_vec());
    cursor.seek(SeekFrom::End(0)).unwrap();
    let mut doc = Blockline::open(cursor, Mode::Streaming).unwrap();
    doc.scan().unwrap();
    let paths: Vec<&str> = doc.index().unwrap().paths().collect();
    assert_eq!(paths, vec!["main/first", "main/second", "main"]);
}
