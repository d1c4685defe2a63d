pub mod crypto;
pub mod extraction;
pub mod folders;
pub mod gemini;
pub mod processor;
pub mod sheets;
pub mod state;
#[cfg(test)]
pub mod testing;
pub mod watcher;
