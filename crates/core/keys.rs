//! Store key derivation with a deployment-wide prefix.

/// Derives every store key from a caller-configured prefix, isolating
/// deployments that share one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a new KeySpace with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Get the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The four keys backing the named queue.
    ///
    /// The queue name is wrapped in a hash tag so that a clustered store
    /// keeps all four keys in one slot.
    pub fn queue(&self, name: &str) -> QueueKeys {
        QueueKeys::new(format!("{}-{{fleet-queue-{}}}-", self.prefix, name))
    }

    /// Key of a lock, with the id normalized to kebab-case.
    pub fn lock(&self, id: &str) -> String {
        format!("{}-fleet-lock-{}", self.prefix, kebab_case(id.trim()))
    }

    /// Hash key of a cache namespace.
    pub fn cache(&self, nsp: &str) -> String {
        format!("{}:{}", self.prefix, nsp)
    }
}

/// Keys of one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Common prefix of every key below.
    pub prefix: String,
    /// LIST of tokens waiting to be claimed.
    pub pending: String,
    /// LIST of tokens moved out of `pending` by a consumer.
    pub doing: String,
    /// HASH token -> claim/heartbeat timestamp in milliseconds.
    pub doing_map: String,
    /// String key throttling the reconciliation sweep.
    pub retrying: String,
}

impl QueueKeys {
    fn new(prefix: String) -> Self {
        Self {
            pending: format!("{prefix}pending"),
            doing: format!("{prefix}doing"),
            doing_map: format!("{prefix}doing-map"),
            retrying: format!("{prefix}retrying"),
            prefix,
        }
    }

    /// Shared "last check" timestamp of a cron riding on this queue.
    pub fn cron_last(&self) -> String {
        format!("{}cron-last", self.prefix)
    }
}

/// Lowercase words joined by `-`. Words break on any non-alphanumeric
/// character, on lower-to-upper case changes, before the last capital of an
/// acronym (`XMLHttp` -> `xml-http`) and between letters and digits.
pub fn kebab_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        // Boundaries use the input character; `current` is already lowercased.
        let prev = match current.is_empty() {
            true => None,
            false => i.checked_sub(1).map(|j| chars[j]),
        };
        if let Some(prev) = prev {
            let next = chars.get(i + 1).copied();
            let boundary = (prev.is_lowercase() && c.is_uppercase())
                || (prev.is_alphabetic() && c.is_numeric())
                || (prev.is_numeric() && c.is_alphabetic())
                || (prev.is_uppercase()
                    && c.is_uppercase()
                    && next.is_some_and(|n| n.is_lowercase()));
            if boundary {
                words.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }

    words.join("-")
}
