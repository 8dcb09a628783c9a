//! Description acquisition: how an item obtains its user-supplied text.
//!
//! Collection asks a [`DescriptionSource`] for each candidate. The default
//! production source prompts on the terminal; tests script outcomes.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use parking_lot::Mutex;

use crate::domain::item::ItemIdentity;
use crate::error::Result;

/// Outcome of asking for a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Use this description for the item.
    Save(String),
    /// Leave the item for a later run.
    Skip,
    /// Never process this item; its record is marked rejected.
    Reject,
}

/// Source of user-supplied descriptions.
pub trait DescriptionSource: Send + Sync {
    /// Ask for a description of `identity`. `progress` is a short
    /// human-readable position marker, e.g. `"3/17"`.
    fn acquire(&self, identity: &ItemIdentity, progress: &str) -> Result<AcquireOutcome>;
}

/// Interactive terminal prompt.
///
/// An empty line skips the item, `!reject` rejects it, anything else is
/// saved as the description.
pub struct PromptDescriptionSource;

impl PromptDescriptionSource {
    fn acquire_from(
        &self,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
        identity: &ItemIdentity,
        progress: &str,
    ) -> Result<AcquireOutcome> {
        writeln!(output, "[{progress}] {identity}")?;
        write!(output, "description (empty = skip, !reject = reject): ")?;
        output.flush()?;

        let mut line = String::new();
        input.read_line(&mut line)?;
        let line = line.trim();
        Ok(match line {
            "" => AcquireOutcome::Skip,
            "!reject" => AcquireOutcome::Reject,
            text => AcquireOutcome::Save(text.to_string()),
        })
    }
}

impl DescriptionSource for PromptDescriptionSource {
    fn acquire(&self, identity: &ItemIdentity, progress: &str) -> Result<AcquireOutcome> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        self.acquire_from(&mut stdin.lock(), &mut stdout.lock(), identity, progress)
    }
}

/// Scripted source for tests: outcomes are consumed FIFO, and requests are
/// recorded.
#[derive(Default)]
pub struct ScriptedDescriptionSource {
    outcomes: Mutex<VecDeque<AcquireOutcome>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedDescriptionSource {
    pub fn new(outcomes: impl IntoIterator<Item = AcquireOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl DescriptionSource for ScriptedDescriptionSource {
    fn acquire(&self, identity: &ItemIdentity, _progress: &str) -> Result<AcquireOutcome> {
        self.requests.lock().push(identity.key());
        Ok(self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(AcquireOutcome::Skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(input: &str) -> AcquireOutcome {
        let mut output = Vec::new();
        PromptDescriptionSource
            .acquire_from(
                &mut input.as_bytes(),
                &mut output,
                &ItemIdentity::new("a.jpg", "h1"),
                "1/1",
            )
            .unwrap()
    }

    #[test]
    fn empty_line_skips() {
        assert_eq!(prompt("\n"), AcquireOutcome::Skip);
    }

    #[test]
    fn reject_keyword_rejects() {
        assert_eq!(prompt("!reject\n"), AcquireOutcome::Reject);
    }

    #[test]
    fn text_is_saved_trimmed() {
        assert_eq!(
            prompt("  a red bridge at dusk  \n"),
            AcquireOutcome::Save("a red bridge at dusk".to_string())
        );
    }

    #[test]
    fn scripted_source_exhausts_to_skip() {
        let source = ScriptedDescriptionSource::new([AcquireOutcome::Reject]);
        let id = ItemIdentity::new("a.jpg", "h1");
        assert_eq!(source.acquire(&id, "1/2").unwrap(), AcquireOutcome::Reject);
        assert_eq!(source.acquire(&id, "2/2").unwrap(), AcquireOutcome::Skip);
        assert_eq!(source.requested().len(), 2);
    }
}
