//! Store key layout
//!
//! ```text
//! {prefix}:token:{blake3(token)}  -> TokenRecord JSON
//! {prefix}:user:{user_id}         -> blake3(token) of the newest token
//! {prefix}:resend:{user_id}       -> resend counter for the current window
//! ```

/// Key builder for one namespace
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    pub fn token(&self, token_hash: &str) -> String {
        format!("{}:token:{}", self.prefix, token_hash)
    }

    pub fn token_prefix(&self) -> String {
        format!("{}:token:", self.prefix)
    }

    pub fn user_index(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    pub fn user_index_prefix(&self) -> String {
        format!("{}:user:", self.prefix)
    }

    pub fn resend(&self, user_id: &str) -> String {
        format!("{}:resend:{}", self.prefix, user_id)
    }
}

/// Short, non-reversible tag for log lines
pub fn log_tag(token_hash: &str) -> &str {
    token_hash.get(..8).unwrap_or(token_hash)
}
