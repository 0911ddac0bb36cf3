use std::fmt;

use gpreagg_error::Result;

use crate::arrays::chunk::InputChunk;

/// Produces the input chunks of a scan.
pub trait ChunkSource {
    /// Get the next chunk, or None once the scan is exhausted.
    fn next_chunk(&mut self) -> Result<Option<InputChunk>>;
}

impl<I> ChunkSource for I
where
    I: Iterator<Item = InputChunk>,
{
    fn next_chunk(&mut self) -> Result<Option<InputChunk>> {
        Ok(self.next())
    }
}

/// Reads one chunk ahead so the last chunk of a scan can be identified when
/// it's handed out.
pub(crate) struct Lookahead {
    source: Box<dyn ChunkSource + Send>,
    peeked: Option<InputChunk>,
    exhausted: bool,
}

impl Lookahead {
    pub(crate) fn new(source: Box<dyn ChunkSource + Send>) -> Self {
        Lookahead {
            source,
            peeked: None,
            exhausted: false,
        }
    }

    /// Get the next chunk along with whether it's the last one.
    pub(crate) fn next(&mut self) -> Result<Option<(InputChunk, bool)>> {
        if self.exhausted {
            return Ok(None);
        }

        let chunk = match self.peeked.take() {
            Some(chunk) => chunk,
            None => match self.source.next_chunk()? {
                Some(chunk) => chunk,
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            },
        };

        self.peeked = self.source.next_chunk()?;
        let is_last = self.peeked.is_none();
        if is_last {
            self.exhausted = true;
        }

        Ok(Some((chunk, is_last)))
    }
}

impl fmt::Debug for Lookahead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookahead")
            .field("peeked", &self.peeked.is_some())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}
