// Category classifier contract

/// Picks a category for a patch saved without one. An empty return means
/// "no opinion" and the library default applies.
pub trait CategoryClassifier: Send + Sync {
    fn detect_category(&self, name: &str, tags: &[String]) -> String;
}

impl<F> CategoryClassifier for F
where
    F: Fn(&str, &[String]) -> String + Send + Sync,
{
    fn detect_category(&self, name: &str, tags: &[String]) -> String {
        self(name, tags)
    }
}
