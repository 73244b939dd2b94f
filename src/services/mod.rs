pub mod cache;
pub mod crypto;
pub mod documents;
pub mod extraction;
pub mod functions;
pub mod monitor;
pub mod notifications;
pub mod openai;
pub mod prazos;
pub mod session;
pub mod state;
pub mod storage;
