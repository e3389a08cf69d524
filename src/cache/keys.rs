//! Cache key layout.
//!
//! Each key is a resource prefix ending in `:` followed by its selector, so invalidating
//! `cache:post:1:` can never touch `cache:post:10:`. Post lists with a free-text search term
//! have no key at all.
//!
//! User keys are produced by this service's own reads. Post keys and [`Mutation::Post`]
//! serve the post read and write paths, which live outside this crate and share the store.

pub const POST_LISTS: &str = "cache:posts:list:";

#[must_use]
pub fn post_list(
    category: Option<u64>,
    page: u32,
    size: u32,
    search: Option<&str>,
) -> Option<String> {
    if search.is_some_and(|term| !term.trim().is_empty()) {
        return None;
    }
    let category = category.map_or_else(|| "all".to_string(), |c| c.to_string());
    Some(format!("{POST_LISTS}cat={category}:page={page}:size={size}"))
}

#[must_use]
pub fn post_prefix(post_id: u64) -> String {
    format!("cache:post:{post_id}:")
}

#[must_use]
pub fn post_detail(post_id: u64) -> String {
    format!("{}detail", post_prefix(post_id))
}

#[must_use]
pub fn user_prefix(user_id: u64) -> String {
    format!("cache:user:{user_id}:")
}

#[must_use]
pub fn user_posts(user_id: u64, page: u32, size: u32) -> String {
    format!("{}posts:page={page}:size={size}", user_prefix(user_id))
}

#[must_use]
pub fn user_public(user_id: u64) -> String {
    format!("{}public", user_prefix(user_id))
}

#[must_use]
pub fn username_prefix(username: &str) -> String {
    format!("cache:uname:{username}:")
}

#[must_use]
pub fn user_public_by_name(username: &str) -> String {
    format!("{}public", username_prefix(username))
}

/// A write that makes some cached views stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Post created, edited or deleted.
    Post { post_id: u64, author_id: u64 },
    /// Profile fields, points or streak changed.
    User { user_id: u64, username: String },
}

impl Mutation {
    /// Prefixes to invalidate. Lists are cached under many parameterizations, so the whole
    /// family goes.
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        match self {
            Self::Post { post_id, author_id } => vec![
                POST_LISTS.to_string(),
                post_prefix(*post_id),
                format!("{}posts:", user_prefix(*author_id)),
            ],
            Self::User { user_id, username } => {
                vec![user_prefix(*user_id), username_prefix(username)]
            }
        }
    }
}
