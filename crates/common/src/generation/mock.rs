//! Deterministic offline provider
//!
//! Answers from the first source block in the user turn so the whole
//! pipeline can run without network access.

use super::{GenerationProvider, GenerationRequest};
use crate::errors::ProviderError;
use async_trait::async_trait;

const NOT_COVERED: &str = "The provided documents do not cover this question.";

#[derive(Debug, Default, Clone, Copy)]
pub struct MockGenerationProvider;

impl MockGenerationProvider {
    fn answer(user: &str) -> String {
        let Some(start) = user.find("[Source: ") else {
            return NOT_COVERED.to_string();
        };
        let header_and_rest = &user[start + "[Source: ".len()..];
        let Some((title, rest)) = header_and_rest.split_once(" | ") else {
            return NOT_COVERED.to_string();
        };
        let passage = rest
            .split_once('\n')
            .map(|(_, body)| body)
            .unwrap_or_default()
            .lines()
            .next()
            .unwrap_or_default()
            .trim();

        if passage.is_empty() || passage == "CONTEXT END" {
            return NOT_COVERED.to_string();
        }
        let sentence = match passage.find(['.', '!', '?']) {
            Some(end) => &passage[..=end],
            None => passage,
        };
        format!("According to [{}], {}", title.trim(), sentence)
    }
}

#[async_trait]
impl GenerationProvider for MockGenerationProvider {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        Ok(Self::answer(&request.user))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answers_from_first_source() {
        let user = "CONTEXT START\n\
            [Source: Grace | Author: Ada | Relevance: 0.91]\n\
            Grace is unmerited favor. It is given freely.\n\n\
            CONTEXT END\n\n\
            QUESTION START\nWhat is grace?\nQUESTION END";
        assert_eq!(
            MockGenerationProvider::answer(user),
            "According to [Grace], Grace is unmerited favor."
        );
    }

    #[test]
    fn test_no_context() {
        let user = "CONTEXT START\n\nCONTEXT END\n\nQUESTION START\nWhat is grace?\nQUESTION END";
        assert_eq!(MockGenerationProvider::answer(user), NOT_COVERED);
    }
}
