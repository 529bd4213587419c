//! Per-session topic namespace.
//!
//! ```text
//! {root}/{seed}           base
//! {root}/{seed}/status    connection status, QoS 1
//! {root}/{seed}/info      informational text, QoS 1
//! {root}/{seed}/warning   size-policy warnings, QoS 1
//! {root}/{seed}/photo     raw image bytes, QoS 2
//! ```
//!
//! The seed is taken once at startup (session start time in milliseconds), so
//! every process run publishes under its own base.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopicNamespace {
    seed: i64,
    base: String,
    status: String,
    info: String,
    warning: String,
    photo: String,
}

impl SessionTopicNamespace {
    pub fn from_seed(root: &str, seed: i64) -> Self {
        let root = root.trim_matches('/');
        let base = if root.is_empty() {
            seed.to_string()
        } else {
            format!("{}/{}", root, seed)
        };

        Self {
            seed,
            status: format!("{}/status", base),
            info: format!("{}/info", base),
            warning: format!("{}/warning", base),
            photo: format!("{}/photo", base),
            base,
        }
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn warning(&self) -> &str {
        &self.warning
    }

    pub fn photo(&self) -> &str {
        &self.photo
    }

    /// Client identity for one transport session. A new generation is used
    /// for every connect so two sessions never share an identity.
    pub fn client_id(&self, prefix: &str, generation: u64) -> String {
        format!("{}-{}-{}", prefix, self.seed, generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_all_sub_topics_from_base() {
        let topics = SessionTopicNamespace::from_seed("camera", 1_700_000_000_123);

        assert_eq!(topics.base(), "camera/1700000000123");
        assert_eq!(topics.status(), "camera/1700000000123/status");
        assert_eq!(topics.info(), "camera/1700000000123/info");
        assert_eq!(topics.warning(), "camera/1700000000123/warning");
        assert_eq!(topics.photo(), "camera/1700000000123/photo");
    }

    #[test]
    fn same_seed_same_topics() {
        let a = SessionTopicNamespace::from_seed("camera", 42);
        let b = SessionTopicNamespace::from_seed("camera", 42);
        assert_eq!(a, b);

        let c = SessionTopicNamespace::from_seed("camera", 43);
        assert_ne!(a.photo(), c.photo());
    }

    #[test]
    fn root_slashes_are_normalized() {
        let topics = SessionTopicNamespace::from_seed("/devices/cam/", 7);
        assert_eq!(topics.base(), "devices/cam/7");

        let bare = SessionTopicNamespace::from_seed("", 7);
        assert_eq!(bare.status(), "7/status");
    }

    #[test]
    fn client_ids_differ_per_generation() {
        let topics = SessionTopicNamespace::from_seed("camera", 5);
        assert_eq!(topics.client_id("photolink", 1), "photolink-5-1");
        assert_ne!(
            topics.client_id("photolink", 1),
            topics.client_id("photolink", 2)
        );
    }
}
