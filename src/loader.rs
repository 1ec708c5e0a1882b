//! Streaming heap snapshot parser.
//!
//! A `.heapsnapshot` file is one large JSON object whose bulk lives in a
//! few flat arrays of unsigned integers (`nodes`, `edges`, ...). Parsing
//! the whole file through a JSON DOM would roughly triple peak memory, so
//! the loader scans those arrays digit by digit into preallocated integer
//! buffers and only hands the small parts (the `snapshot` metadata header,
//! the nested `trace_tree`, the `strings` table) to `serde_json`.
//!
//! The wire format is strictly sequential: `snapshot` header, `nodes`,
//! `edges`, optional allocation traces, optional `samples`, optional
//! `locations`, then `strings` last. The loader is push-based: feed it
//! chunks with [`SnapshotLoader::write`], then [`SnapshotLoader::close`]
//! at end of stream, then take the result.

use serde::Deserialize;
use std::cell::RefCell;
use std::rc::Rc;

use crate::snapshot::{HeapSnapshot, Result, SnapshotError};
use crate::tokenizer::BalancedJsonTokenizer;

/// Sink for loader and snapshot progress. The analysis phases can take
/// seconds on large snapshots; implementations forward status to a UI or
/// log. All methods default to no-ops.
pub trait Progress {
    fn update_status(&mut self, _status: &str) {}
    fn update_progress(&mut self, _status: &str, _done: usize, _total: usize) {}
    fn report_problem(&mut self, _error: &str) {}
}

/// Progress sink that discards everything.
pub struct NullProgress;

impl Progress for NullProgress {}

// ============================================================================
// Wire format header types
// ============================================================================

/// The `snapshot` header object at the top of the file.
#[derive(Debug, Deserialize)]
pub struct SnapshotHeader {
    pub meta: FieldMeta,
    pub node_count: u32,
    pub edge_count: u32,
    #[serde(default)]
    pub trace_function_count: u32,
    #[serde(default)]
    pub root_index: u32,
}

/// Field layout descriptors from `snapshot.meta`. The flat arrays are
/// records of `*_fields.len()` values each; `*_types` carries the string
/// tables for `type` fields (first element is the array of type names).
#[derive(Debug, Deserialize)]
pub struct FieldMeta {
    pub node_fields: Vec<String>,
    pub node_types: Vec<serde_json::Value>,
    pub edge_fields: Vec<String>,
    pub edge_types: Vec<serde_json::Value>,
    #[serde(default)]
    pub trace_function_info_fields: Vec<String>,
    #[serde(default)]
    pub trace_node_fields: Vec<String>,
    #[serde(default)]
    pub sample_fields: Vec<String>,
    #[serde(default)]
    pub location_fields: Vec<String>,
}

/// Fully parsed snapshot file, before any index building.
pub struct Profile {
    pub header: SnapshotHeader,
    pub nodes: Vec<u32>,
    pub edges: Vec<u32>,
    pub trace_function_infos: Vec<u32>,
    pub trace_tree: serde_json::Value,
    pub samples: Vec<u64>,
    pub locations: Vec<u32>,
    pub strings: Vec<String>,
}

// ============================================================================
// Loader state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    Nodes,
    Edges,
    TraceFunctionInfos,
    Samples,
    Locations,
}

impl ArrayKind {
    fn token(self) -> &'static str {
        match self {
            ArrayKind::Nodes => "\"nodes\"",
            ArrayKind::Edges => "\"edges\"",
            ArrayKind::TraceFunctionInfos => "\"trace_function_infos\"",
            ArrayKind::Samples => "\"samples\"",
            ArrayKind::Locations => "\"locations\"",
        }
    }

    fn status(self) -> &'static str {
        match self {
            ArrayKind::Nodes => "Loading nodes",
            ArrayKind::Edges => "Loading edges",
            ArrayKind::TraceFunctionInfos => "Loading allocation traces",
            ArrayKind::Samples => "Loading samples",
            ArrayKind::Locations => "Loading locations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FindSnapshotKey,
    ParseHeader,
    FindArrayName(ArrayKind),
    FindArrayBracket(ArrayKind),
    ScanArray(ArrayKind),
    ParseTraceTree,
    FindStringsName,
    FindStringsBracket,
    AccumulateStrings,
    Done,
}

/// Push-based streaming parser for the heap snapshot wire format.
pub struct SnapshotLoader {
    progress: Box<dyn Progress>,
    buffer: String,
    state: State,
    tokenizer: Option<BalancedJsonTokenizer<Box<dyn FnMut(&str)>>>,
    header_json: Rc<RefCell<Option<String>>>,
    header: Option<SnapshotHeader>,
    node_field_count: usize,
    edge_field_count: usize,
    trace_info_field_count: usize,
    node_count: usize,
    edge_count: usize,
    trace_function_count: usize,
    has_samples: bool,
    has_locations: bool,
    nodes: Vec<u32>,
    edges: Vec<u32>,
    trace_function_infos: Vec<u32>,
    trace_tree: serde_json::Value,
    samples: Vec<u64>,
    locations: Vec<u32>,
    strings: Vec<String>,
}

impl SnapshotLoader {
    pub fn new() -> Self {
        Self::with_progress(Box::new(NullProgress))
    }

    pub fn with_progress(progress: Box<dyn Progress>) -> Self {
        SnapshotLoader {
            progress,
            buffer: String::new(),
            state: State::FindSnapshotKey,
            tokenizer: None,
            header_json: Rc::new(RefCell::new(None)),
            header: None,
            node_field_count: 0,
            edge_field_count: 0,
            trace_info_field_count: 0,
            node_count: 0,
            edge_count: 0,
            trace_function_count: 0,
            has_samples: false,
            has_locations: false,
            nodes: Vec::new(),
            edges: Vec::new(),
            trace_function_infos: Vec::new(),
            trace_tree: serde_json::Value::Null,
            samples: Vec::new(),
            locations: Vec::new(),
            strings: Vec::new(),
        }
    }

    /// Feeds the next chunk of the snapshot stream. Chunk boundaries are
    /// arbitrary; numbers, tokens and string escapes may be split anywhere.
    pub fn write(&mut self, chunk: &str) -> Result<()> {
        self.buffer.push_str(chunk);
        self.advance()
    }

    /// Marks end of stream and finishes the trailing `strings` array.
    pub fn close(&mut self) -> Result<()> {
        self.advance()?;
        match self.state {
            State::AccumulateStrings => {
                let close = self.buffer.rfind(']').ok_or_else(|| {
                    SnapshotError::IncompleteInput("strings array has no closing bracket".into())
                })?;
                self.strings = serde_json::from_str(&self.buffer[..=close])?;
                self.buffer.clear();
                self.state = State::Done;
                Ok(())
            }
            State::Done => Ok(()),
            _ => Err(SnapshotError::IncompleteInput(
                "stream ended before the strings array".into(),
            )),
        }
    }

    /// Consumes the loader and returns the raw parsed arrays.
    pub fn into_profile(self) -> Result<Profile> {
        if self.state != State::Done {
            return Err(SnapshotError::IncompleteInput(
                "snapshot stream was not fully parsed".into(),
            ));
        }
        let header = self.header.ok_or_else(|| {
            SnapshotError::IncompleteInput("snapshot header was never parsed".into())
        })?;
        Ok(Profile {
            header,
            nodes: self.nodes,
            edges: self.edges,
            trace_function_infos: self.trace_function_infos,
            trace_tree: self.trace_tree,
            samples: self.samples,
            locations: self.locations,
            strings: self.strings,
        })
    }

    /// Consumes the loader, builds all derived indexes and returns the
    /// ready-to-query snapshot.
    pub fn build_snapshot(mut self) -> Result<HeapSnapshot> {
        let mut progress = std::mem::replace(&mut self.progress, Box::new(NullProgress));
        let profile = self.into_profile()?;
        HeapSnapshot::new(profile, progress.as_mut())
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::FindSnapshotKey => {
                    const TOKEN: &str = "\"snapshot\"";
                    let Some(pos) = self.buffer.find(TOKEN) else {
                        return Ok(());
                    };
                    let after = pos + TOKEN.len();
                    let Some(colon) = self.buffer[after..].find(':') else {
                        return Ok(());
                    };
                    self.buffer.drain(..after + colon + 1);
                    let slot = Rc::clone(&self.header_json);
                    self.tokenizer = Some(BalancedJsonTokenizer::new(
                        Box::new(move |json: &str| {
                            *slot.borrow_mut() = Some(json.to_string());
                        }),
                        false,
                    ));
                    self.progress.update_status("Loading snapshot info");
                    self.state = State::ParseHeader;
                }
                State::ParseHeader => {
                    let Some(mut tokenizer) = self.tokenizer.take() else {
                        return Ok(());
                    };
                    let chunk = std::mem::take(&mut self.buffer);
                    tokenizer.write(&chunk);
                    let balanced = self.header_json.borrow_mut().take();
                    match balanced {
                        Some(json) => {
                            self.buffer = tokenizer.remainder().to_string();
                            self.parse_header(&json)?;
                            self.progress.update_status(ArrayKind::Nodes.status());
                            self.state = State::FindArrayName(ArrayKind::Nodes);
                        }
                        None => {
                            self.tokenizer = Some(tokenizer);
                            return Ok(());
                        }
                    }
                }
                State::FindArrayName(kind) => {
                    let Some(pos) = self.buffer.find(kind.token()) else {
                        return Ok(());
                    };
                    self.buffer.drain(..pos + kind.token().len());
                    self.state = State::FindArrayBracket(kind);
                }
                State::FindArrayBracket(kind) => {
                    let Some(pos) = self.buffer.find('[') else {
                        return Ok(());
                    };
                    self.buffer.drain(..=pos);
                    self.state = State::ScanArray(kind);
                }
                State::ScanArray(kind) => {
                    let done = match kind {
                        ArrayKind::Nodes => parse_uint_array(&mut self.buffer, &mut self.nodes),
                        ArrayKind::Edges => parse_uint_array(&mut self.buffer, &mut self.edges),
                        ArrayKind::TraceFunctionInfos => {
                            parse_uint_array(&mut self.buffer, &mut self.trace_function_infos)
                        }
                        ArrayKind::Samples => parse_uint_array(&mut self.buffer, &mut self.samples),
                        ArrayKind::Locations => {
                            parse_uint_array(&mut self.buffer, &mut self.locations)
                        }
                    };
                    self.check_array_fill(kind, done)?;
                    if !done {
                        return Ok(());
                    }
                    self.next_phase(kind)?;
                }
                State::ParseTraceTree => {
                    // The trace tree is nested, not flat, so it is cut out as
                    // text and parsed whole. It contains no string literals,
                    // so the first quote after its colon is the next key.
                    let Some(colon) = self.buffer.find(':') else {
                        return Ok(());
                    };
                    let Some(quote) = self.buffer[colon..].find('"') else {
                        return Ok(());
                    };
                    let quote = colon + quote;
                    let open = self.buffer.find('[').ok_or_else(|| {
                        SnapshotError::InvalidSnapshot("trace_tree array start not found".into())
                    })?;
                    let close = self.buffer[..quote].rfind(']').ok_or_else(|| {
                        SnapshotError::InvalidSnapshot("trace_tree array end not found".into())
                    })?;
                    if close < open {
                        return Err(SnapshotError::InvalidSnapshot(
                            "malformed trace_tree array".into(),
                        ));
                    }
                    self.trace_tree = serde_json::from_str(&self.buffer[open..=close])?;
                    self.buffer.drain(..=close);
                    self.enter_samples_phase();
                }
                State::FindStringsName => {
                    const TOKEN: &str = "\"strings\"";
                    let Some(pos) = self.buffer.find(TOKEN) else {
                        return Ok(());
                    };
                    self.buffer.drain(..pos + TOKEN.len());
                    self.state = State::FindStringsBracket;
                }
                State::FindStringsBracket => {
                    let Some(pos) = self.buffer.find('[') else {
                        return Ok(());
                    };
                    // Keep the bracket; the accumulated text is parsed as a
                    // JSON array on close().
                    self.buffer.drain(..pos);
                    self.progress.update_status("Loading strings");
                    self.state = State::AccumulateStrings;
                }
                State::AccumulateStrings | State::Done => return Ok(()),
            }
        }
    }

    fn parse_header(&mut self, json: &str) -> Result<()> {
        let header: SnapshotHeader = serde_json::from_str(json)?;
        if header.meta.node_fields.is_empty() || header.meta.edge_fields.is_empty() {
            return Err(SnapshotError::InvalidSnapshot(
                "snapshot meta is missing node_fields or edge_fields".into(),
            ));
        }
        self.node_field_count = header.meta.node_fields.len();
        self.edge_field_count = header.meta.edge_fields.len();
        self.trace_info_field_count = header.meta.trace_function_info_fields.len();
        self.node_count = header.node_count as usize;
        self.edge_count = header.edge_count as usize;
        self.trace_function_count = header.trace_function_count as usize;
        self.has_samples = !header.meta.sample_fields.is_empty();
        self.has_locations = !header.meta.location_fields.is_empty();
        self.nodes = Vec::with_capacity(self.node_count * self.node_field_count);
        self.edges = Vec::with_capacity(self.edge_count * self.edge_field_count);
        self.trace_function_infos =
            Vec::with_capacity(self.trace_function_count * self.trace_info_field_count);
        self.header = Some(header);
        Ok(())
    }

    fn expected_len(&self, kind: ArrayKind) -> Option<usize> {
        match kind {
            ArrayKind::Nodes => Some(self.node_count * self.node_field_count),
            ArrayKind::Edges => Some(self.edge_count * self.edge_field_count),
            ArrayKind::TraceFunctionInfos => {
                Some(self.trace_function_count * self.trace_info_field_count)
            }
            ArrayKind::Samples | ArrayKind::Locations => None,
        }
    }

    fn filled_len(&self, kind: ArrayKind) -> usize {
        match kind {
            ArrayKind::Nodes => self.nodes.len(),
            ArrayKind::Edges => self.edges.len(),
            ArrayKind::TraceFunctionInfos => self.trace_function_infos.len(),
            ArrayKind::Samples => self.samples.len(),
            ArrayKind::Locations => self.locations.len(),
        }
    }

    fn check_array_fill(&mut self, kind: ArrayKind, done: bool) -> Result<()> {
        let filled = self.filled_len(kind);
        match self.expected_len(kind) {
            Some(expected) => {
                if filled > expected || (done && filled != expected) {
                    return Err(SnapshotError::InvalidSnapshot(format!(
                        "{} array has {} values, expected {}",
                        kind.token().trim_matches('"'),
                        filled,
                        expected
                    )));
                }
                self.progress.update_progress(kind.status(), filled, expected);
            }
            None => self.progress.update_progress(kind.status(), filled, filled),
        }
        Ok(())
    }

    fn next_phase(&mut self, finished: ArrayKind) -> Result<()> {
        match finished {
            ArrayKind::Nodes => {
                self.progress.update_status(ArrayKind::Edges.status());
                self.state = State::FindArrayName(ArrayKind::Edges);
            }
            ArrayKind::Edges => {
                if self.trace_function_count > 0 {
                    self.progress
                        .update_status(ArrayKind::TraceFunctionInfos.status());
                    self.state = State::FindArrayName(ArrayKind::TraceFunctionInfos);
                } else {
                    self.enter_samples_phase();
                }
            }
            ArrayKind::TraceFunctionInfos => {
                self.state = State::ParseTraceTree;
            }
            ArrayKind::Samples => self.enter_locations_phase(),
            ArrayKind::Locations => self.state = State::FindStringsName,
        }
        Ok(())
    }

    fn enter_samples_phase(&mut self) {
        if self.has_samples {
            self.progress.update_status(ArrayKind::Samples.status());
            self.state = State::FindArrayName(ArrayKind::Samples);
        } else {
            self.enter_locations_phase();
        }
    }

    fn enter_locations_phase(&mut self) {
        if self.has_locations {
            self.progress.update_status(ArrayKind::Locations.status());
            self.state = State::FindArrayName(ArrayKind::Locations);
        } else {
            self.state = State::FindStringsName;
        }
    }
}

impl Default for SnapshotLoader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Digit-by-digit uint array scanning
// ============================================================================

trait UintSink {
    fn put(&mut self, value: u64);
}

impl UintSink for Vec<u32> {
    fn put(&mut self, value: u64) {
        self.push(value as u32);
    }
}

impl UintSink for Vec<u64> {
    fn put(&mut self, value: u64) {
        self.push(value);
    }
}

/// Scans decimal unsigned integers out of `buffer` into `sink` until the
/// array's closing `]`. Returns `true` when the bracket was consumed. A
/// number touching the end of the buffer may still be split across chunks,
/// so it is kept in the buffer for the next call.
fn parse_uint_array<S: UintSink>(buffer: &mut String, sink: &mut S) -> bool {
    let done;
    let keep_from;
    {
        let bytes = buffer.as_bytes();
        let len = bytes.len();
        let mut index = 0;
        loop {
            while index < len && !bytes[index].is_ascii_digit() && bytes[index] != b']' {
                index += 1;
            }
            if index == len {
                done = false;
                keep_from = len;
                break;
            }
            if bytes[index] == b']' {
                done = true;
                keep_from = index + 1;
                break;
            }
            let start = index;
            let mut value: u64 = 0;
            while index < len && bytes[index].is_ascii_digit() {
                value = value * 10 + u64::from(bytes[index] - b'0');
                index += 1;
            }
            if index == len {
                done = false;
                keep_from = start;
                break;
            }
            sink.put(value);
        }
    }
    buffer.drain(..keep_from);
    done
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> &'static str {
        r#"{"snapshot":{"meta":{
            "node_fields":["type","name","id","self_size","edge_count","trace_node_id"],
            "node_types":[["hidden","array","string","object","code","closure","regexp","number","native","synthetic","concatenated string","sliced string"],"string","number","number","number","number"],
            "edge_fields":["type","name_or_index","to_node"],
            "edge_types":[["context","element","property","internal","hidden","shortcut","weak"],"string_or_number","node"]},
            "node_count":3,"edge_count":2},
        "nodes":[9,0,1,0,1,0,
                 3,1,3,10,1,0,
                 3,2,5,20,0,0],
        "edges":[2,3,6,
                 2,4,12],
        "strings":["(root)","A","B","a","b"]}"#
    }

    fn sample_with_samples_and_locations() -> &'static str {
        r#"{"snapshot":{"meta":{
            "node_fields":["type","name","id","self_size","edge_count","trace_node_id"],
            "node_types":[["hidden","array","string","object","code","closure","regexp","number","native","synthetic","concatenated string","sliced string"],"string","number","number","number","number"],
            "edge_fields":["type","name_or_index","to_node"],
            "edge_types":[["context","element","property","internal","hidden","shortcut","weak"],"string_or_number","node"],
            "sample_fields":["timestamp_us","last_assigned_id"],
            "location_fields":["object_index","script_id","line","column"]},
            "node_count":3,"edge_count":2},
        "nodes":[9,0,1,0,1,0,
                 3,1,3,10,1,0,
                 3,2,5,20,0,0],
        "edges":[2,3,6,
                 2,4,12],
        "samples":[1000000,4,2000000,6],
        "locations":[6,2,10,4],
        "strings":["(root)","A","B","a","b"]}"#
    }

    fn load_whole(json: &str) -> Profile {
        let mut loader = SnapshotLoader::new();
        loader.write(json).unwrap();
        loader.close().unwrap();
        loader.into_profile().unwrap()
    }

    #[test]
    fn parses_basic_snapshot() {
        let profile = load_whole(sample_snapshot());
        assert_eq!(profile.header.node_count, 3);
        assert_eq!(profile.header.edge_count, 2);
        assert_eq!(profile.nodes.len(), 18);
        assert_eq!(profile.nodes[..6], [9, 0, 1, 0, 1, 0]);
        assert_eq!(profile.edges, vec![2, 3, 6, 2, 4, 12]);
        assert_eq!(profile.strings, vec!["(root)", "A", "B", "a", "b"]);
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let whole = load_whole(sample_snapshot());

        let mut loader = SnapshotLoader::new();
        for ch in sample_snapshot().chars() {
            loader.write(&ch.to_string()).unwrap();
        }
        loader.close().unwrap();
        let tiny = loader.into_profile().unwrap();

        assert_eq!(whole.nodes, tiny.nodes);
        assert_eq!(whole.edges, tiny.edges);
        assert_eq!(whole.strings, tiny.strings);
    }

    #[test]
    fn parses_samples_and_locations() {
        let profile = load_whole(sample_with_samples_and_locations());
        assert_eq!(profile.samples, vec![1000000, 4, 2000000, 6]);
        assert_eq!(profile.locations, vec![6, 2, 10, 4]);
        assert_eq!(profile.strings.len(), 5);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let json = sample_snapshot();
        let mut loader = SnapshotLoader::new();
        loader.write(&json[..json.len() / 2]).unwrap();
        assert!(matches!(
            loader.close(),
            Err(SnapshotError::IncompleteInput(_))
        ));
    }

    #[test]
    fn node_array_length_mismatch_is_an_error() {
        // node_count says 3 but only two node records are present.
        let json = r#"{"snapshot":{"meta":{
            "node_fields":["type","name","id","self_size","edge_count","trace_node_id"],
            "node_types":[["hidden"],"string","number","number","number","number"],
            "edge_fields":["type","name_or_index","to_node"],
            "edge_types":[["context"],"string_or_number","node"]},
            "node_count":3,"edge_count":0},
        "nodes":[0,0,1,0,0,0,
                 0,0,3,0,0,0],
        "edges":[],
        "strings":[""]}"#;
        let mut loader = SnapshotLoader::new();
        let result = loader.write(json);
        assert!(matches!(result, Err(SnapshotError::InvalidSnapshot(_))));
    }

    #[test]
    fn scans_numbers_split_across_chunks() {
        let mut out: Vec<u32> = Vec::new();
        let mut buffer = String::from("12");
        assert!(!parse_uint_array(&mut buffer, &mut out));
        buffer.push_str("34,5");
        assert!(!parse_uint_array(&mut buffer, &mut out));
        buffer.push_str("6]");
        assert!(parse_uint_array(&mut buffer, &mut out));
        assert_eq!(out, vec![1234, 56]);
    }
}
