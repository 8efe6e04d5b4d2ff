use crate::config::StepSpec;
use crate::error::{Error, Result};
use crate::pipeline::registry::{StepFactory, mismatch};
use crate::pipeline::{HasStatistics, Step, StepState, StepStatistics, read_text};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

enum Matcher {
    Literal(String),
    Pattern(Regex),
}

struct Rule {
    key: String,
    matcher: Matcher,
    replacement: String,
}

impl Rule {
    fn apply(&self, text: &str) -> Option<(String, usize)> {
        match &self.matcher {
            Matcher::Literal(needle) => {
                let hits = text.matches(needle.as_str()).count();
                (hits > 0).then(|| (text.replace(needle.as_str(), &self.replacement), hits))
            }
            Matcher::Pattern(re) => {
                let hits = re.find_iter(text).count();
                (hits > 0).then(|| (re.replace_all(text, self.replacement.as_str()).into_owned(), hits))
            }
        }
    }
}

pub fn factory(spec: &StepSpec) -> Result<StepFactory> {
    let (cfg, regex, kind) = match spec {
        StepSpec::ReplaceChars(cfg) => (cfg, false, "replace-chars"),
        StepSpec::ReplaceRegex(cfg) => (cfg, true, "replace-regex"),
        other => return Err(mismatch("replace-chars/replace-regex", other)),
    };
    if cfg.mapping.is_empty() {
        return Err(Error::config(format!("{kind} needs a non-empty mapping")));
    }
    let rules = cfg
        .mapping
        .iter()
        .map(|(key, replacement)| {
            if key.is_empty() {
                return Err(Error::config(format!("{kind}: empty key in mapping")));
            }
            let matcher = if regex {
                Matcher::Pattern(
                    Regex::new(key).map_err(|e| Error::config(format!("{kind}: pattern {key:?}: {e}")))?,
                )
            } else {
                Matcher::Literal(key.clone())
            };
            Ok(Rule {
                key: key.clone(),
                matcher,
                replacement: replacement.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let rules = Arc::new(rules);
    let backup = cfg.backup;
    Ok(Box::new(move || -> Box<dyn Step> {
        Box::new(Replace {
            kind,
            rules: Arc::clone(&rules),
            backup,
            counts: BTreeMap::new(),
        })
    }))
}

/// In-place substitution on the current text file, counting hits per mapping key.
pub struct Replace {
    kind: &'static str,
    rules: Arc<Vec<Rule>>,
    backup: bool,
    counts: BTreeMap<String, usize>,
}

impl Step for Replace {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn execute(&mut self, state: &mut StepState) -> Result<()> {
        let path = &state.path_in;
        let mut text = read_text(self.kind, path)?;

        let mut counts = BTreeMap::new();
        for rule in self.rules.iter() {
            if let Some((replaced, hits)) = rule.apply(&text) {
                text = replaced;
                counts.insert(rule.key.clone(), hits);
            }
        }
        if counts.is_empty() {
            debug!(page = %state.page_id, "{}: nothing to replace", self.kind);
            self.counts = counts;
            return Ok(());
        }

        if self.backup {
            let mut backup = path.clone().into_os_string();
            backup.push(".bak");
            let backup = PathBuf::from(backup);
            if !backup.exists() {
                std::fs::copy(path, &backup)
                    .map_err(|e| Error::io(format!("backing up {}", path.display()), e))?;
            }
        }
        std::fs::write(path, text).map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        debug!(page = %state.page_id, ?counts, "{}: replaced", self.kind);
        self.counts = counts;
        Ok(())
    }
}

impl HasStatistics for Replace {
    fn statistics(&self) -> Option<StepStatistics> {
        Some(StepStatistics::Replacements(self.counts.clone()))
    }
}
