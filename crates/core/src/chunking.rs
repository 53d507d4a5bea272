use crate::error::PipelineError;
use crate::models::{Chunk, PipelineOptions, SourceDocument};

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
    pub boundary_window: usize,
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Result<Self, PipelineError> {
        Self::with_window(max_chars, overlap_chars, default_window(max_chars))
    }

    pub fn with_window(
        max_chars: usize,
        overlap_chars: usize,
        boundary_window: usize,
    ) -> Result<Self, PipelineError> {
        if max_chars == 0 {
            return Err(PipelineError::Config(
                "max chunk size must be greater than zero".to_string(),
            ));
        }
        if overlap_chars >= max_chars {
            return Err(PipelineError::Config(format!(
                "chunk overlap ({overlap_chars}) must be less than chunk size ({max_chars})"
            )));
        }
        Ok(Self {
            max_chars,
            overlap_chars,
            boundary_window: boundary_window.min(max_chars),
        })
    }
}

impl TryFrom<&PipelineOptions> for ChunkingConfig {
    type Error = PipelineError;

    fn try_from(options: &PipelineOptions) -> Result<Self, Self::Error> {
        let window = options
            .chunk_boundary_window
            .unwrap_or_else(|| default_window(options.chunk_max_chars));
        Self::with_window(options.chunk_max_chars, options.chunk_overlap_chars, window)
    }
}

fn default_window(max_chars: usize) -> usize {
    (max_chars / 4).max(1)
}

/// Boundary kinds in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Paragraph,
    Sentence,
    Word,
    Hard,
}

const SOFT_BOUNDARIES: [Boundary; 3] = [Boundary::Paragraph, Boundary::Sentence, Boundary::Word];

/// Splits a document into overlapping chunks of at most `max_chunk_chars` characters.
pub fn split(
    document: &SourceDocument,
    max_chunk_chars: usize,
    overlap_chars: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    let config = ChunkingConfig::new(max_chunk_chars, overlap_chars)?;
    Ok(split_with(document, &config))
}

pub fn split_with(document: &SourceDocument, config: &ChunkingConfig) -> Vec<Chunk> {
    let chars: Vec<char> = document.raw_text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let (end, boundary) = if total - start <= config.max_chars {
            (total, Boundary::Hard)
        } else {
            chunk_end(&chars, start, config)
        };

        chunks.push(Chunk {
            id: chunks.len(),
            text: chars[start..end].iter().collect(),
            source_url: document.url.clone(),
            start_offset: start,
        });

        if end == total {
            break;
        }
        start = next_start(&chars, start, end, boundary, config.overlap_chars);
    }

    chunks
}

fn chunk_end(chars: &[char], start: usize, config: &ChunkingConfig) -> (usize, Boundary) {
    let hard_end = start + config.max_chars;
    let floor = (start + 1).max(hard_end.saturating_sub(config.boundary_window));

    for kind in SOFT_BOUNDARIES {
        if let Some(position) = (floor..=hard_end)
            .rev()
            .find(|&position| is_boundary(chars, position, kind))
        {
            return (position, kind);
        }
    }

    (hard_end, Boundary::Hard)
}

/// Start of the following chunk: the earliest boundary of the same kind inside the
/// overlap budget, so sentence-cut chunks overlap by whole sentences or not at all.
fn next_start(
    chars: &[char],
    start: usize,
    end: usize,
    boundary: Boundary,
    overlap: usize,
) -> usize {
    let floor = (start + 1).max(end.saturating_sub(overlap));
    if boundary == Boundary::Hard {
        return floor;
    }

    (floor..=end)
        .find(|&position| is_boundary(chars, position, boundary))
        .unwrap_or(end)
}

fn is_boundary(chars: &[char], position: usize, kind: Boundary) -> bool {
    if position == 0 || position > chars.len() {
        return false;
    }
    let previous = chars[position - 1];

    match kind {
        Boundary::Paragraph => position >= 2 && previous == '\n' && chars[position - 2] == '\n',
        Boundary::Sentence => {
            matches!(previous, '.' | '!' | '?')
                && chars
                    .get(position)
                    .map_or(true, |next| next.is_whitespace())
        }
        Boundary::Word => previous.is_whitespace(),
        Boundary::Hard => true,
    }
}
