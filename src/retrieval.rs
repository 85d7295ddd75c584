//! Retrieval client: embedding plus nearest-neighbour search.
//!
//! Wraps an [`Embedder`] and a [`VectorIndex`] with whole-call deadlines so
//! that every collaborator is bounded, whether or not it talks HTTP.
//! Scores and metadata are passed through exactly as the index returns
//! them; a short result list is not an error.

use course_rag_core::models::Match;
use course_rag_core::upstream::{Embedder, UpstreamFailure, VectorIndex};
use std::sync::Arc;
use std::time::Duration;

use crate::http::with_deadline;

#[derive(Clone)]
pub struct RetrievalClient {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    embed_deadline: Duration,
    search_deadline: Duration,
}

impl RetrievalClient {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        embed_deadline: Duration,
        search_deadline: Duration,
    ) -> Self {
        Self {
            embedder,
            index,
            embed_deadline,
            search_deadline,
        }
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// Embed the question. An empty vector is a malformed response.
    pub async fn embed(&self, question: &str) -> Result<Vec<f32>, UpstreamFailure> {
        let vector = with_deadline(self.embed_deadline, self.embedder.embed(question)).await?;
        if vector.is_empty() {
            return Err(UpstreamFailure::malformed("empty embedding vector"));
        }
        Ok(vector)
    }

    /// Ask the index for exactly `top_k` neighbours.
    pub async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<Match>, UpstreamFailure> {
        with_deadline(self.search_deadline, self.index.query(vector, top_k)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, UpstreamFailure> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingIndex {
        requested: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl VectorIndex for RecordingIndex {
        fn name(&self) -> &str {
            "recording"
        }
        async fn query(&self, _v: &[f32], top_k: usize) -> Result<Vec<Match>, UpstreamFailure> {
            self.requested.lock().unwrap().push(top_k);
            Ok(vec![Match {
                id: "only".into(),
                score: 0.3141,
                metadata: Default::default(),
            }])
        }
    }

    struct HangingIndex;

    #[async_trait]
    impl VectorIndex for HangingIndex {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn query(&self, _v: &[f32], _k: usize) -> Result<Vec<Match>, UpstreamFailure> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn client(embedding: Vec<f32>, index: Arc<dyn VectorIndex>) -> RetrievalClient {
        RetrievalClient::new(
            Arc::new(StubEmbedder(embedding)),
            index,
            Duration::from_secs(1),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_empty_embedding_is_malformed() {
        let c = client(Vec::new(), Arc::new(RecordingIndex::default()));
        assert!(matches!(
            c.embed("q").await,
            Err(UpstreamFailure::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_search_requests_top_k_and_passes_through() {
        let index = Arc::new(RecordingIndex::default());
        let c = client(vec![1.0], index.clone());
        let matches = c.search(&[1.0], 5).await.unwrap();
        assert_eq!(*index.requested.lock().unwrap(), vec![5]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].score, 0.3141);
    }

    #[tokio::test]
    async fn test_search_deadline() {
        let c = client(vec![1.0], Arc::new(HangingIndex));
        assert_eq!(
            c.search(&[1.0], 3).await.unwrap_err(),
            UpstreamFailure::Timeout { after_ms: 50 }
        );
    }
}
