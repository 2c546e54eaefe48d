use log::kv::{self, Key, Value, VisitSource};
use log::{Log, Metadata, Record, SetLoggerError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;

// --- Thread-local batch ID storage ---

thread_local! {
    static CURRENT_BATCH_ID: RefCell<Option<String>> = RefCell::new(None);
}

/// Sets the current batch ID for the calling thread; attached to every record.
pub fn set_current_batch_id(batch_id: String) {
    CURRENT_BATCH_ID.with(|id_cell| {
        *id_cell.borrow_mut() = Some(batch_id);
    });
}

/// Clears the current batch ID for the calling thread.
pub fn clear_current_batch_id() {
    CURRENT_BATCH_ID.with(|id_cell| {
        *id_cell.borrow_mut() = None;
    });
}

// --- Log Record Structure for JSON output ---

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonLogRecord {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub batch_id: Option<String>,
    pub target: String,
    pub module_path: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    #[serde(flatten)] // Flatten to include extra fields directly
    pub extra: HashMap<String, serde_json::Value>,
}

// --- Custom Logger Implementation ---

struct JsonLogger;

/// Helper to collect key-value pairs from `log::kv::Source`
struct KeyValueCollector<'a>(&'a mut HashMap<String, serde_json::Value>);

impl<'a, 'kv> VisitSource<'kv> for KeyValueCollector<'a> {
    fn visit_pair(&mut self, key: Key<'kv>, value: Value<'kv>) -> Result<(), kv::Error> {
        self.0
            .insert(key.as_str().to_string(), json!(value.to_string()));
        Ok(())
    }
}

impl Log for JsonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let batch_id = CURRENT_BATCH_ID.with(|id_cell| id_cell.borrow().clone());

        let mut extra_fields = HashMap::new();
        let mut collector = KeyValueCollector(&mut extra_fields);
        if let Err(e) = record.key_values().visit(&mut collector) {
            eprintln!("Error visiting key-value pairs: {:?}", e);
        }

        let json_record = JsonLogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: record.level().to_string(),
            message: record.args().to_string(),
            batch_id,
            target: record.target().to_string(),
            module_path: record.module_path().map(str::to_string),
            file: record.file().map(str::to_string),
            line: record.line(),
            extra: extra_fields,
        };

        match serde_json::to_string(&json_record) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Failed to serialize log record: {}", e),
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceCell<JsonLogger> = OnceCell::new();

/// Installs the JSON logger once; level comes from `DATAGET_LOG` (default info).
pub fn init() -> Result<(), SetLoggerError> {
    let level = std::env::var("DATAGET_LOG")
        .ok()
        .and_then(|raw| raw.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);

    let logger = LOGGER.get_or_init(|| JsonLogger);
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}
