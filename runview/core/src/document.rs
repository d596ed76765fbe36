//! Run Documents
//!
//! Typed records emitted by the acquisition side. Each document arrives as a
//! `(name, body)` pair; the name selects the variant and the body is decoded
//! with serde.
//!
//! # Design Philosophy
//!
//! Documents are plain data. Every document except `start` points back at its
//! run, either directly (`run_start`) or through an intermediate document
//! (`descriptor` for events, `resource` for datums). Resolving those pointers
//! is the router's job, not the document's.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Run identifier (the `uid` of a start document)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunUid(pub String);

impl RunUid {
    /// Create a run identifier from a string
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Generate a fresh random identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunUid {
    fn from(uid: &str) -> Self {
        Self(uid.to_string())
    }
}

/// Document tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentName {
    /// Opens a run
    Start,
    /// Describes one event stream of a run
    Descriptor,
    /// A single event
    Event,
    /// A columnar page of events
    EventPage,
    /// A single datum
    Datum,
    /// A columnar page of datums
    DatumPage,
    /// Externally stored payload reference
    Resource,
    /// Closes a run
    Stop,
}

impl DocumentName {
    /// Every known tag
    pub const ALL: [DocumentName; 8] = [
        Self::Start,
        Self::Descriptor,
        Self::Event,
        Self::EventPage,
        Self::Datum,
        Self::DatumPage,
        Self::Resource,
        Self::Stop,
    ];

    /// Parse a wire name; unknown names yield `None`
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == name)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Descriptor => "descriptor",
            Self::Event => "event",
            Self::EventPage => "event_page",
            Self::Datum => "datum",
            Self::DatumPage => "datum_page",
            Self::Resource => "resource",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding or validating a document
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Body did not match the shape required by its tag
    #[error("malformed {name} document: {source}")]
    Decode {
        /// Tag the body was decoded as
        name: DocumentName,
        /// Underlying serde error
        source: serde_json::Error,
    },

    /// Document could not be turned back into a JSON body
    #[error("failed to encode {name} document: {source}")]
    Encode {
        /// Tag of the document
        name: DocumentName,
        /// Underlying serde error
        source: serde_json::Error,
    },

    /// Page columns have different lengths
    #[error("ragged {name}: column '{column}' has {found} rows, expected {expected}")]
    RaggedPage {
        /// Page kind
        name: DocumentName,
        /// Offending column
        column: String,
        /// Page height
        expected: usize,
        /// Column length
        found: usize,
    },
}

/// Opens a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    /// Run-unique identifier
    pub uid: RunUid,
    /// Creation time (seconds since the epoch)
    #[serde(default)]
    pub time: f64,
    /// Human-facing sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<u64>,
    /// Everything else, kept verbatim
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl RunStart {
    /// Create a start document for the given run
    pub fn new(uid: impl Into<RunUid>) -> Self {
        Self {
            uid: uid.into(),
            time: now_secs(),
            scan_id: None,
            metadata: Map::new(),
        }
    }

    /// Set the scan id
    #[must_use]
    pub fn with_scan_id(mut self, scan_id: u64) -> Self {
        self.scan_id = Some(scan_id);
        self
    }

    /// Add a metadata entry
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a top-level field by name, including the typed ones
    #[must_use]
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "uid" => Some(Value::String(self.uid.0.clone())),
            "time" => Some(Value::from(self.time)),
            "scan_id" => self.scan_id.map(Value::from),
            other => self.metadata.get(other).cloned(),
        }
    }
}

impl From<String> for RunUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// Description of one data field in an event stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Where the value comes from (device, PV, ...)
    pub source: String,
    /// Value type (`number`, `integer`, `array`, `string`, `boolean`)
    pub dtype: String,
    /// Array shape; empty for scalars
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Set when values are stored externally and referenced by datum id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

impl DataKey {
    /// A scalar numeric field
    pub fn number(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dtype: "number".to_string(),
            shape: Vec::new(),
            external: None,
        }
    }
}

/// Describes one event stream of a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    /// Descriptor identifier (events point at this)
    pub uid: String,
    /// Run this stream belongs to
    pub run_start: RunUid,
    /// Creation time
    #[serde(default)]
    pub time: f64,
    /// Stream name (`primary`, `baseline`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Field descriptions
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    /// Everything else, kept verbatim
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl EventDescriptor {
    /// Create a descriptor with a fresh uid
    pub fn new(run_start: &RunUid, name: impl Into<String>) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            run_start: run_start.clone(),
            time: now_secs(),
            name: Some(name.into()),
            data_keys: BTreeMap::new(),
            metadata: Map::new(),
        }
    }

    /// Add a field description
    #[must_use]
    pub fn with_data_key(mut self, field: impl Into<String>, key: DataKey) -> Self {
        self.data_keys.insert(field.into(), key);
        self
    }
}

/// A single event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Descriptor this event belongs to
    pub descriptor: String,
    /// Event identifier
    pub uid: String,
    /// Position within the stream (1-based by convention)
    pub seq_num: u64,
    /// Event time
    pub time: f64,
    /// Field values
    pub data: BTreeMap<String, Value>,
    /// Per-field readout times
    #[serde(default)]
    pub timestamps: BTreeMap<String, f64>,
    /// Whether external fields have been resolved
    #[serde(default)]
    pub filled: BTreeMap<String, bool>,
}

/// A columnar page of events; all columns share the page height
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    /// Descriptor these events belong to
    pub descriptor: String,
    /// Event identifiers
    pub uid: Vec<String>,
    /// Sequence numbers
    pub seq_num: Vec<u64>,
    /// Event times
    pub time: Vec<f64>,
    /// Field columns
    pub data: BTreeMap<String, Vec<Value>>,
    /// Per-field readout time columns
    #[serde(default)]
    pub timestamps: BTreeMap<String, Vec<f64>>,
    /// Per-field fill flags
    #[serde(default)]
    pub filled: BTreeMap<String, Vec<bool>>,
}

impl EventPage {
    /// Build a page from data columns, numbering rows from `first_seq_num`
    ///
    /// The page height is taken from the first column.
    pub fn from_columns<I, K>(descriptor: impl Into<String>, first_seq_num: u64, columns: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<Value>)>,
        K: Into<String>,
    {
        let data: BTreeMap<String, Vec<Value>> =
            columns.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let height = data.values().next().map_or(0, Vec::len);
        let now = now_secs();

        let timestamps = data
            .keys()
            .map(|k| (k.clone(), vec![now; height]))
            .collect();

        Self {
            descriptor: descriptor.into(),
            uid: (0..height).map(|_| uuid::Uuid::new_v4().to_string()).collect(),
            seq_num: (first_seq_num..first_seq_num + height as u64).collect(),
            time: vec![now; height],
            data,
            timestamps,
            filled: BTreeMap::new(),
        }
    }

    /// Wrap a single event into a page of height 1
    #[must_use]
    pub fn from_event(event: &Event) -> Self {
        Self {
            descriptor: event.descriptor.clone(),
            uid: vec![event.uid.clone()],
            seq_num: vec![event.seq_num],
            time: vec![event.time],
            data: event
                .data
                .iter()
                .map(|(k, v)| (k.clone(), vec![v.clone()]))
                .collect(),
            timestamps: event
                .timestamps
                .iter()
                .map(|(k, v)| (k.clone(), vec![*v]))
                .collect(),
            filled: event
                .filled
                .iter()
                .map(|(k, v)| (k.clone(), vec![*v]))
                .collect(),
        }
    }

    /// Number of events in the page
    #[must_use]
    pub fn height(&self) -> usize {
        self.seq_num.len()
    }

    /// Check that every column has the page height
    pub fn validate(&self) -> Result<(), DocumentError> {
        let expected = self.height();
        let ragged = |column: &str, found: usize| DocumentError::RaggedPage {
            name: DocumentName::EventPage,
            column: column.to_string(),
            expected,
            found,
        };

        if self.uid.len() != expected {
            return Err(ragged("uid", self.uid.len()));
        }
        if self.time.len() != expected {
            return Err(ragged("time", self.time.len()));
        }
        for (field, column) in &self.data {
            if column.len() != expected {
                return Err(ragged(field, column.len()));
            }
        }
        for (field, column) in &self.timestamps {
            if column.len() != expected {
                return Err(ragged(field, column.len()));
            }
        }
        for (field, column) in &self.filled {
            if column.len() != expected {
                return Err(ragged(field, column.len()));
            }
        }
        Ok(())
    }

    /// Split into index-ordered events
    ///
    /// Short columns (only possible on an unvalidated page) leave their
    /// field out of the affected rows.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        (0..self.height())
            .map(|i| Event {
                descriptor: self.descriptor.clone(),
                uid: self.uid.get(i).cloned().unwrap_or_default(),
                seq_num: self.seq_num[i],
                time: self.time.get(i).copied().unwrap_or_default(),
                data: row(&self.data, i),
                timestamps: row(&self.timestamps, i),
                filled: row(&self.filled, i),
            })
            .collect()
    }
}

/// Externally stored payload reference
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier (datums point at this)
    pub uid: String,
    /// Run this resource belongs to
    #[serde(default)]
    pub run_start: Option<RunUid>,
    /// Storage format name, resolved through the handler registry
    pub spec: String,
    /// Storage root
    #[serde(default)]
    pub root: String,
    /// Path relative to `root`
    #[serde(default)]
    pub resource_path: String,
    /// Format-specific arguments
    #[serde(default)]
    pub resource_kwargs: Map<String, Value>,
}

/// A single datum
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Resource this datum belongs to
    pub resource: String,
    /// Datum identifier
    pub datum_id: String,
    /// Format-specific arguments
    #[serde(default)]
    pub datum_kwargs: Map<String, Value>,
}

/// A columnar page of datums
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatumPage {
    /// Resource these datums belong to
    pub resource: String,
    /// Datum identifiers
    pub datum_id: Vec<String>,
    /// Argument columns
    #[serde(default)]
    pub datum_kwargs: BTreeMap<String, Vec<Value>>,
}

impl DatumPage {
    /// Wrap a single datum into a page of height 1
    #[must_use]
    pub fn from_datum(datum: &Datum) -> Self {
        Self {
            resource: datum.resource.clone(),
            datum_id: vec![datum.datum_id.clone()],
            datum_kwargs: datum
                .datum_kwargs
                .iter()
                .map(|(k, v)| (k.clone(), vec![v.clone()]))
                .collect(),
        }
    }

    /// Number of datums in the page
    #[must_use]
    pub fn height(&self) -> usize {
        self.datum_id.len()
    }

    /// Check that every column has the page height
    pub fn validate(&self) -> Result<(), DocumentError> {
        let expected = self.height();
        for (key, column) in &self.datum_kwargs {
            if column.len() != expected {
                return Err(DocumentError::RaggedPage {
                    name: DocumentName::DatumPage,
                    column: key.clone(),
                    expected,
                    found: column.len(),
                });
            }
        }
        Ok(())
    }

    /// Split into index-ordered datums
    #[must_use]
    pub fn datums(&self) -> Vec<Datum> {
        self.datum_id
            .iter()
            .enumerate()
            .map(|(i, id)| Datum {
                resource: self.resource.clone(),
                datum_id: id.clone(),
                datum_kwargs: self
                    .datum_kwargs
                    .iter()
                    .filter_map(|(k, column)| column.get(i).map(|v| (k.clone(), v.clone())))
                    .collect(),
            })
            .collect()
    }
}

/// Closes a run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Stop document identifier
    pub uid: String,
    /// Run being closed
    pub run_start: RunUid,
    /// Close time
    #[serde(default)]
    pub time: f64,
    /// `success`, `abort` or `fail`
    #[serde(default = "default_exit_status")]
    pub exit_status: String,
    /// Free-form reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Event count per stream name
    #[serde(default)]
    pub num_events: BTreeMap<String, u64>,
}

impl RunStop {
    /// Successful stop for the given run
    #[must_use]
    pub fn new(run_start: &RunUid) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            run_start: run_start.clone(),
            time: now_secs(),
            exit_status: default_exit_status(),
            reason: None,
            num_events: BTreeMap::new(),
        }
    }
}

fn default_exit_status() -> String {
    "success".to_string()
}

/// Any document
#[derive(Clone, Debug, PartialEq)]
pub enum Document {
    /// Opens a run
    Start(RunStart),
    /// Describes an event stream
    Descriptor(EventDescriptor),
    /// A single event
    Event(Event),
    /// A page of events
    EventPage(EventPage),
    /// A single datum
    Datum(Datum),
    /// A page of datums
    DatumPage(DatumPage),
    /// External payload reference
    Resource(Resource),
    /// Closes a run
    Stop(RunStop),
}

impl Document {
    /// Tag of this document
    #[must_use]
    pub fn name(&self) -> DocumentName {
        match self {
            Self::Start(_) => DocumentName::Start,
            Self::Descriptor(_) => DocumentName::Descriptor,
            Self::Event(_) => DocumentName::Event,
            Self::EventPage(_) => DocumentName::EventPage,
            Self::Datum(_) => DocumentName::Datum,
            Self::DatumPage(_) => DocumentName::DatumPage,
            Self::Resource(_) => DocumentName::Resource,
            Self::Stop(_) => DocumentName::Stop,
        }
    }

    /// Decode a `(name, body)` pair; unknown names decode to `None`
    pub fn decode(name: &str, body: Value) -> Result<Option<Self>, DocumentError> {
        match DocumentName::parse(name) {
            Some(name) => Self::from_value(name, body).map(Some),
            None => Ok(None),
        }
    }

    /// Decode a body as the given document kind
    pub fn from_value(name: DocumentName, body: Value) -> Result<Self, DocumentError> {
        let decode_err = |source| DocumentError::Decode { name, source };
        let doc = match name {
            DocumentName::Start => Self::Start(serde_json::from_value(body).map_err(decode_err)?),
            DocumentName::Descriptor => {
                Self::Descriptor(serde_json::from_value(body).map_err(decode_err)?)
            }
            DocumentName::Event => Self::Event(serde_json::from_value(body).map_err(decode_err)?),
            DocumentName::EventPage => {
                Self::EventPage(serde_json::from_value(body).map_err(decode_err)?)
            }
            DocumentName::Datum => Self::Datum(serde_json::from_value(body).map_err(decode_err)?),
            DocumentName::DatumPage => {
                Self::DatumPage(serde_json::from_value(body).map_err(decode_err)?)
            }
            DocumentName::Resource => {
                Self::Resource(serde_json::from_value(body).map_err(decode_err)?)
            }
            DocumentName::Stop => Self::Stop(serde_json::from_value(body).map_err(decode_err)?),
        };
        Ok(doc)
    }

    /// Encode the body back to JSON
    pub fn to_value(&self) -> Result<Value, DocumentError> {
        let name = self.name();
        let encoded = match self {
            Self::Start(doc) => serde_json::to_value(doc),
            Self::Descriptor(doc) => serde_json::to_value(doc),
            Self::Event(doc) => serde_json::to_value(doc),
            Self::EventPage(doc) => serde_json::to_value(doc),
            Self::Datum(doc) => serde_json::to_value(doc),
            Self::DatumPage(doc) => serde_json::to_value(doc),
            Self::Resource(doc) => serde_json::to_value(doc),
            Self::Stop(doc) => serde_json::to_value(doc),
        };
        encoded.map_err(|source| DocumentError::Encode { name, source })
    }

    /// Structural checks beyond what decoding enforces
    pub fn validate(&self) -> Result<(), DocumentError> {
        match self {
            Self::EventPage(page) => page.validate(),
            Self::DatumPage(page) => page.validate(),
            _ => Ok(()),
        }
    }
}

impl From<RunStart> for Document {
    fn from(doc: RunStart) -> Self {
        Self::Start(doc)
    }
}

impl From<EventDescriptor> for Document {
    fn from(doc: EventDescriptor) -> Self {
        Self::Descriptor(doc)
    }
}

impl From<Event> for Document {
    fn from(doc: Event) -> Self {
        Self::Event(doc)
    }
}

impl From<EventPage> for Document {
    fn from(doc: EventPage) -> Self {
        Self::EventPage(doc)
    }
}

impl From<Datum> for Document {
    fn from(doc: Datum) -> Self {
        Self::Datum(doc)
    }
}

impl From<DatumPage> for Document {
    fn from(doc: DatumPage) -> Self {
        Self::DatumPage(doc)
    }
}

impl From<Resource> for Document {
    fn from(doc: Resource) -> Self {
        Self::Resource(doc)
    }
}

impl From<RunStop> for Document {
    fn from(doc: RunStop) -> Self {
        Self::Stop(doc)
    }
}

fn row<T: Clone>(columns: &BTreeMap<String, Vec<T>>, index: usize) -> BTreeMap<String, T> {
    columns
        .iter()
        .filter_map(|(k, column)| column.get(index).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// Current time in seconds since the epoch
pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
