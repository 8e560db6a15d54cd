// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row types read back from the mirror.

use crate::records::VoteDirection;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ActorRow {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CommunityRow {
    pub id: i64,
    pub uri: String,
    pub actor_did: String,
    pub rkey: String,
    pub name: String,
    pub description: Option<String>,
    pub content_hash: Option<String>,
    pub member_count: i64,
    pub post_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PostRow {
    pub id: i64,
    pub uri: String,
    pub actor_did: String,
    pub rkey: String,
    pub community_id: i64,
    pub title: Option<String>,
    pub text: String,
    /// JSON-encoded embed, if any.
    pub embed: Option<String>,
    /// JSON-encoded array of tags.
    pub tags: String,
    pub reply_parent_uri: Option<String>,
    pub reply_root_uri: Option<String>,
    /// Local id of the parent whose `comment_count` this post incremented.
    pub counted_parent_id: Option<i64>,
    pub content_hash: String,
    pub vote_count: i64,
    pub comment_count: i64,
}

impl PostRow {
    pub fn is_reply(&self) -> bool {
        self.reply_root_uri.is_some()
    }

    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VoteRow {
    pub id: i64,
    pub uri: String,
    pub actor_did: String,
    pub subject_uri: String,
    /// Local id of the post whose `vote_count` carries this vote's effect.
    pub subject_post_id: Option<i64>,
    pub direction: String,
}

impl VoteRow {
    pub fn direction(&self) -> Option<VoteDirection> {
        VoteDirection::parse(&self.direction)
    }
}

/// Row totals, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorCounts {
    pub actors: i64,
    pub communities: i64,
    pub posts: i64,
    pub votes: i64,
}
