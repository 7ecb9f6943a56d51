//! Username block lists published as plain text at a URL.

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};

use crate::clients::{Fetched, Platform};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ListData {
    users: Vec<String>,
    etag: Option<String>,
}

#[derive(Debug, Default)]
pub struct OnlineBlocklist {
    lists: BTreeMap<String, ListData>,
    /// Lowercased union of every list.
    users: HashSet<String>,
}

impl OnlineBlocklist {
    pub fn new(urls: impl IntoIterator<Item = String>) -> Self {
        Self {
            lists: urls.into_iter().map(|url| (url, ListData::default())).collect(),
            users: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Re-downloads every list. A list that fails to refresh keeps its old data.
    pub async fn refresh(&mut self, platform: &dyn Platform) {
        if self.lists.is_empty() {
            return;
        }
        info!(count = self.lists.len(), "Refreshing online blocklists");
        for (url, data) in self.lists.iter_mut() {
            match platform.fetch_text(url, data.etag.as_deref()).await {
                Ok(Fetched::NotModified) => {}
                Ok(Fetched::Body { text, etag }) => {
                    *data = ListData {
                        users: parse_users(&text),
                        etag,
                    };
                }
                Err(e) => warn!(%url, error = %e, "Failed to refresh online blocklist"),
            }
        }
        self.users = self
            .lists
            .values()
            .flat_map(|d| d.users.iter().map(|u| u.to_lowercase()))
            .collect();
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains(&username.to_lowercase())
    }

    pub fn users(&self) -> &HashSet<String> {
        &self.users
    }
}

fn parse_users(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
