use std::collections::HashMap;

use anyhow::{Result, bail};

/// Label set attached to a pod. Keys are unique.
pub type LabelSet = HashMap<String, String>;

/// Parse `key=value` pairs (as given on a command line) into a label set.
/// Later pairs overwrite earlier ones with the same key.
pub fn parse_label_pairs<I, S>(pairs: I) -> Result<LabelSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut labels = LabelSet::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, value)) = pair.split_once('=') else {
            bail!("label '{}' is not of the form key=value", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("label '{}' has an empty key", pair);
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}
