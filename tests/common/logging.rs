//! Test logging, driven by the environment: `SILENT=true` discards everything,
//! `E2E_LOG_TO_FILES=true` writes each node's output to its own file under `logs/<test name>/`
//! (the engine logs with the node id as the log target), and otherwise everything goes to
//! stdout.

use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Mutex, Once, OnceLock};

use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();
static LOGS_DIR: OnceLock<PathBuf> = OnceLock::new();
static LOG_FILES: OnceLock<Mutex<HashMap<String, File>>> = OnceLock::new();

pub(crate) fn setup_logger(test_name: &str) {
    LOGGER_INIT.call_once(|| {
        let silent = env::var("SILENT").map(|v| v == "true").unwrap_or(false);
        let to_files = env::var("E2E_LOG_TO_FILES")
            .map(|v| v == "true")
            .unwrap_or(false);

        let dispatch = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}] {}",
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .level(LevelFilter::Debug);

        let dispatch = if silent {
            dispatch.chain(fern::Output::call(|_| {}))
        } else if to_files {
            let dir = PathBuf::from("logs").join(test_name);
            if fs::create_dir_all(&dir).is_ok() {
                let _ = LOGS_DIR.set(dir);
                dispatch.chain(fern::Output::call(write_to_node_file))
            } else {
                eprintln!("could not create the logs directory, logging to stdout");
                dispatch.chain(std::io::stdout())
            }
        } else {
            dispatch.chain(std::io::stdout())
        };

        let _ = dispatch.apply();
    })
}

// One file per log target (per node); opened lazily on the node's first record.
fn write_to_node_file(record: &log::Record) {
    let dir = match LOGS_DIR.get() {
        Some(dir) => dir,
        None => return,
    };
    let files = LOG_FILES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut files = files.lock().unwrap();
    let target = record.target().to_string();
    if !files.contains_key(&target) {
        let path = dir.join(format!("{target}.log"));
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                files.insert(target.clone(), file);
            }
            Err(_) => return,
        }
    }
    if let Some(file) = files.get_mut(&target) {
        let _ = writeln!(file, "{}", record.args());
    }
}
