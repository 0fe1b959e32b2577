//! Token-aware embedding batch assembly.
//!
//! Accumulates chunk texts into batches that stay under the safety-margined
//! token budget (0.9 × the model limit by default). A chunk that alone
//! exceeds the budget is force-emitted as a singleton batch rather than
//! blocking the pipeline. Batch order preserves chunk order, so
//! concatenating batch results reassembles the file.

use crate::models::Chunk;

/// One closed batch of chunk texts bound for a single embedding call.
#[derive(Debug, Clone)]
pub struct ChunkBatch {
    /// Indices into the file's chunk list, ascending.
    pub chunk_indices: Vec<usize>,
    pub texts: Vec<String>,
    pub token_estimate: usize,
}

impl ChunkBatch {
    fn new() -> Self {
        Self {
            chunk_indices: Vec::new(),
            texts: Vec::new(),
            token_estimate: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Group `chunks` into batches whose token totals never exceed
/// `token_limit`, except for forced singletons carrying a single oversized
/// chunk.
pub fn assemble_batches<F>(chunks: &[Chunk], token_limit: usize, count_tokens: F) -> Vec<ChunkBatch>
where
    F: Fn(&str) -> usize,
{
    let mut batches = Vec::new();
    let mut current = ChunkBatch::new();

    for chunk in chunks {
        let tokens = count_tokens(&chunk.text);

        if tokens > token_limit {
            // Oversized chunk: close whatever is open, then emit the chunk
            // alone so the pipeline never stalls on it.
            if !current.is_empty() {
                batches.push(std::mem::replace(&mut current, ChunkBatch::new()));
            }
            batches.push(ChunkBatch {
                chunk_indices: vec![chunk.index],
                texts: vec![chunk.text.clone()],
                token_estimate: tokens,
            });
            continue;
        }

        if current.token_estimate + tokens > token_limit && !current.is_empty() {
            batches.push(std::mem::replace(&mut current, ChunkBatch::new()));
        }

        current.chunk_indices.push(chunk.index);
        current.texts.push(chunk.text.clone());
        current.token_estimate += tokens;
    }

    if !current.is_empty() {
        batches.push(current);
    }

    batches
}
