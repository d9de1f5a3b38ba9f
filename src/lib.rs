//! docs-rag - 마크다운 문서 Q&A RAG 시스템
//!
//! 마크다운 코퍼스를 헤더 단위로 청킹하여 LanceDB에 임베딩으로 저장하고,
//! 질문에 대해 유사 청크를 검색한 뒤 출처를 인용하는 그라운딩된 답변을
//! 생성합니다. 멀티턴 대화에서는 히스토리를 반영해 검색 질의를
//! 재작성합니다.

pub mod chunker;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod eval;
pub mod indexer;
pub mod llm;
pub mod mermaid;
pub mod rag;
pub mod session;
pub mod store;

// Re-exports
pub use chunker::{default_chunker, Chunk, Chunker, MarkdownChunker};
pub use config::{get_api_key, get_data_dir, has_api_key, Settings};
pub use embedding::{EmbeddingProvider, EmbeddingTask, GeminiEmbedding};
pub use eval::{EvalCase, EvalReport, EvalResult, EvalScore, Evaluator};
pub use indexer::{collect_markdown_files, index_directory, IndexStats};
pub use llm::{
    ChatMessage, ChatRole, GeminiGeneration, GenerationProvider, GenerationRequest,
    GenerationResponse, LlmError, TokenStream,
};
pub use rag::{Answer, AnswerEvent, AnswerStream, RagError, RagPipeline, Source};
pub use session::SessionManager;
pub use store::{cosine_similarity, LanceVectorStore, VectorMatch, VectorRecord, VectorStore};
