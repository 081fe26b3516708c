use fxhash::FxHashMap;
use std::sync::Mutex;

/// Boundary to the chunk writer.
///
/// The formatter hands over closed chunk buffers keyed `NNNNNN`,
/// `NNNNNN_pre` or `NNNNNN_post`; whatever sits behind this trait owns file
/// naming, compression and disk layout.
pub trait ChunkSink: Send + Sync {
    fn receive_chunk(&self, key: &str, data: Vec<u8>) -> std::io::Result<()>;
}

/// Sink that only reports what it is given. Stands in for the writer when
/// running simulated.
#[derive(Debug, Default)]
pub struct LogSink;

impl ChunkSink for LogSink {
    fn receive_chunk(&self, key: &str, data: Vec<u8>) -> std::io::Result<()> {
        spdlog::info!(
            "Chunk {} closed with {}",
            key,
            human_bytes::human_bytes(data.len() as f64)
        );
        Ok(())
    }
}

/// Sink that keeps every chunk in memory for inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: Mutex<FxHashMap<String, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(&self, key: &str) -> Option<Vec<u8>> {
        self.chunks.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.chunks.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl ChunkSink for MemorySink {
    fn receive_chunk(&self, key: &str, data: Vec<u8>) -> std::io::Result<()> {
        self.chunks
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(&data);
        Ok(())
    }
}
