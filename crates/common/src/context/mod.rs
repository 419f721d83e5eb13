//! Context and prompt construction
//!
//! - Token-budgeted context assembly with source attribution
//! - Injection screening of user questions
//! - Prompt templating, token accounting and the output leak guard

mod assembler;
mod prompt;
mod sanitizer;

pub use assembler::{
    format_entry, Candidate, ContextAssembler, ContextBundle, GreedyBestFirst, Packing,
    PackingStrategy, Source,
};
pub use prompt::{
    system_template, PromptBuilder, PromptPayload, TokenAccounting, LEAK_REFUSAL, SYSTEM_RULES,
};
pub use sanitizer::{InjectionGuard, ScreenedQuery, SAFE_REDIRECT};
