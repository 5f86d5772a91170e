//! Mock RegistryClient for unit testing
//!
//! Stores the set of existing images in memory and records every lookup with
//! the credentials it was made with.

use crate::auth::RegistryCredentials;
use crate::error::RegistryError;
use crate::registry_trait::RegistryClientTrait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Mock RegistryClient for testing
#[derive(Debug, Clone, Default)]
pub struct MockRegistryClient {
    images: Arc<Mutex<HashSet<String>>>,
    lookups: Arc<Mutex<Vec<(String, RegistryCredentials)>>>,
    fail: Arc<AtomicBool>,
}

impl MockRegistryClient {
    /// Create a new mock with no images
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image to the mock registry (for test setup)
    pub fn add_image(&self, image: impl Into<String>) {
        self.images.lock().unwrap().insert(image.into());
    }

    /// Remove an image from the mock registry
    pub fn remove_image(&self, image: &str) {
        self.images.lock().unwrap().remove(image);
    }

    /// Make every lookup fail with an API error
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.lock().unwrap().len()
    }

    /// Credentials of the most recent lookup of `image`
    pub fn credentials_for(&self, image: &str) -> Option<RegistryCredentials> {
        self.lookups
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(looked_up, _)| looked_up == image)
            .map(|(_, credentials)| credentials.clone())
    }
}

#[async_trait::async_trait]
impl RegistryClientTrait for MockRegistryClient {
    async fn image_exists(&self, image: &str, credentials: &RegistryCredentials) -> Result<bool, RegistryError> {
        self.lookups
            .lock()
            .unwrap()
            .push((image.to_string(), credentials.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(RegistryError::Api(format!("mock registry failure for {}", image)));
        }
        Ok(self.images.lock().unwrap().contains(image))
    }
}
