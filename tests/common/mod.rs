#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::{Value, json};
use uuid::Uuid;

use populate_scamplers::api::{ApiFailure, ApiRequest, TrackingClient};
use populate_scamplers::error::PopulateError;
use populate_scamplers::submit::SubmitOptions;

/// Serves fixed listings and accepts every creation.
#[derive(Default)]
pub struct MockTracking {
    listings: HashMap<String, Vec<Value>>,
    pub listed: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<ApiRequest>>,
}

impl MockTracking {
    pub fn with_listing(mut self, path: &str, records: Vec<Value>) -> Self {
        self.listings.insert(path.to_string(), records);
        self
    }

    pub fn listed_paths(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.body.clone())
            .collect()
    }
}

impl TrackingClient for MockTracking {
    fn list(&self, path: &str) -> Result<Vec<Value>, PopulateError> {
        self.listed.lock().unwrap().push(path.to_string());
        Ok(self.listings.get(path).cloned().unwrap_or_default())
    }

    fn send(&self, request: &ApiRequest) -> Result<Value, ApiFailure> {
        self.sent.lock().unwrap().push(request.clone());
        let id = match request.body.get("id") {
            Some(id) => id.clone(),
            None => json!(Uuid::new_v4()),
        };
        Ok(json!({"id": id}))
    }
}

pub struct Workspace {
    _temp: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("csv")).unwrap();
        Self { _temp: temp, root }
    }

    pub fn csv_dir(&self) -> Utf8PathBuf {
        self.root.join("csv")
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.root.join("cache")
    }

    pub fn write_csv(&self, name: &str, content: &str) {
        std::fs::write(self.csv_dir().join(name), content).unwrap();
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            dry_run: false,
            print_requests: false,
            save_requests: None,
            print_responses: false,
            save_responses: None,
            error_dir: self.root.join("errors"),
            max_concurrency: 4,
        }
    }
}
