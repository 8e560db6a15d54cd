// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed record bodies for the mirrored collections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reference to another record: a bare URI or a strong ref `{uri, cid}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UriRef {
    Plain(String),
    Strong {
        uri: String,
        #[serde(default)]
        cid: Option<String>,
    },
}

impl UriRef {
    pub fn uri(&self) -> &str {
        match self {
            UriRef::Plain(uri) => uri,
            UriRef::Strong { uri, .. } => uri,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunityRecord {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRef {
    pub parent: UriRef,
    pub root: UriRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
    pub community: UriRef,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub embed: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PostRecord {
    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Contribution to the subject's `vote_count`.
    pub fn delta(self) -> i64 {
        match self {
            VoteDirection::Up => 1,
            VoteDirection::Down => -1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VoteDirection::Up => "up",
            VoteDirection::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(VoteDirection::Up),
            "down" => Some(VoteDirection::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRecord {
    pub subject: UriRef,
    pub direction: VoteDirection,
}
