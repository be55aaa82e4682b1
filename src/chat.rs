//! Question answering over retrieved sources.
//!
//! Every operation builds a message list from the prompt templates in
//! [`welearn_core::prompts`] and the client's history, then calls the LLM.
//! History windows follow the front-end contract:
//!
//! | Operation | History sent |
//! |-----------|--------------|
//! | past-reference check | all but the last 2 messages |
//! | reformulation | all but the last 5 messages |
//! | new questions | last message and the one two before it |
//! | rephrase | the 4 messages before the last one |
//! | answer | the whole history |

use anyhow::{anyhow, Result};
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

use welearn_core::lang;
use welearn_core::models::{
    Document, Message, QueryStatus, ReformulatedQueryResponse, ReformulatedQuestionsResponse,
};
use welearn_core::prompts::{self, extract_json_from_response, fill, stringify_docs_content};

use crate::error::ApiError;
use crate::llm::{completion_value, CompletionOptions, LlmClient};

const DEFAULT_CURSUS: &str = "General";

pub struct ChatService {
    llm: Arc<dyn LlmClient>,
}

/// `history[..len - n]`, empty when the history is shorter than `n`.
fn all_but_last(history: &[Message], n: usize) -> &[Message] {
    &history[..history.len().saturating_sub(n)]
}

/// JSON object from a completion that may be raw text around an object.
fn as_object(value: Value) -> Result<Value> {
    match value {
        Value::Object(_) => Ok(value),
        Value::String(s) => extract_json_from_response(&s),
        other => Err(anyhow!("Invalid response from model: {}", other)),
    }
}

impl ChatService {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// ISO code of the query: `en` or `fr`. Falls back to the LLM when
    /// statistical detection fails.
    pub async fn detect_language(&self, query: &str) -> Result<String> {
        match lang::detect_language(query) {
            Ok(code) => return Ok(code),
            Err(_) => info!(query, "language not detected locally, asking the llm"),
        }
        let messages = [Message::user(fill(
            prompts::CHECK_LANGUAGE_PROMPT,
            &[("query", query)],
        ))];
        let value = completion_value(self.llm.as_ref(), &messages, CompletionOptions::json()).await?;
        let code = as_object(value)
            .ok()
            .and_then(|v| v["ISO_CODE"].as_str().map(|c| c.trim().to_lowercase()));
        match code {
            Some(code) if lang::is_supported(&code) => Ok(code),
            other => {
                warn!(detected = ?other, "api_error=LANG_NOT_SUPPORTED");
                Err(ApiError::LangNotSupported.into())
            }
        }
    }

    /// Whether the query refers to earlier messages. Any failure counts as no.
    pub async fn detect_past_message_ref(&self, query: &str, history: &[Message]) -> bool {
        let mut messages = vec![Message::system(prompts::SYSTEM_PAST_MESSAGE_REF)];
        messages.extend_from_slice(all_but_last(history, 2));
        messages.push(Message::user(fill(prompts::PAST_MESSAGE_REF, &[("query", query)])));

        let result = completion_value(self.llm.as_ref(), &messages, CompletionOptions::json())
            .await
            .and_then(as_object);
        match result {
            Ok(v) => match v["REF_TO_PAST"].as_bool() {
                Some(flag) => flag,
                None => {
                    error!(response = %v, "api_error=invalid_json");
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "past message reference check failed");
                false
            }
        }
    }

    /// Rewrite the query as a standalone question in English and French.
    pub async fn reformulate_user_query(
        &self,
        query: &str,
        history: &[Message],
    ) -> Result<ReformulatedQueryResponse> {
        if self.detect_past_message_ref(query, history).await {
            let status = if history.is_empty() {
                QueryStatus::Invalid
            } else {
                QueryStatus::RefToPast
            };
            return Ok(ReformulatedQueryResponse {
                standalone_question_en: Some(query.to_string()),
                standalone_question_fr: Some(query.to_string()),
                user_language: None,
                query_status: Some(status),
            });
        }

        let mut messages = vec![Message::system(prompts::SYSTEM_PROMPT_STANDALONE_QUESTION)];
        messages.extend_from_slice(all_but_last(history, 5));
        messages.push(Message::user(format!("{}{}", prompts::STANDALONE_QUESTION, query)));

        let value = completion_value(self.llm.as_ref(), &messages, CompletionOptions::json()).await?;
        let parsed = as_object(value.clone())
            .and_then(|v| serde_json::from_value::<ReformulatedQueryResponse>(v).map_err(Into::into));
        match parsed {
            Ok(r) => Ok(r),
            Err(e) => {
                error!(error = %e, response = %value, "api_error=json_load_error");
                Err(ApiError::reformulate().into())
            }
        }
    }

    /// Follow-up questions, split on `%%`.
    pub async fn get_new_questions(
        &self,
        query: &str,
        history: &[Message],
    ) -> Result<ReformulatedQuestionsResponse> {
        self.detect_language(query).await?;

        let mut messages: Vec<Message> = history.iter().rev().step_by(2).take(2).cloned().collect();
        messages.push(Message::user(format!("{}{}", prompts::GENERATE_NEW_QUESTIONS, query)));

        let raw = self.llm.complete(&messages, CompletionOptions::default()).await?;
        let new_questions = raw
            .split("%%")
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
        Ok(ReformulatedQuestionsResponse { new_questions })
    }

    fn rephrase_messages(
        &self,
        docs: &[Document],
        message: &str,
        history: &[Message],
        subject: Option<&str>,
    ) -> Vec<Message> {
        let cursus = subject.unwrap_or(DEFAULT_CURSUS);
        let start = history.len().saturating_sub(5);
        let end = history.len().saturating_sub(1).max(start);

        let mut messages = vec![Message::system(fill(prompts::SYSTEM_PROMPT, &[("cursus", cursus)]))];
        messages.extend_from_slice(&history[start..end]);
        messages.push(Message::user(fill(
            prompts::REPHRASE,
            &[
                ("documents", &stringify_docs_content(docs)),
                ("prompt", message),
            ],
        )));
        messages
    }

    /// Rewrite the last assistant answer for the subject's audience.
    pub async fn rephrase_message(
        &self,
        docs: &[Document],
        message: &str,
        history: &[Message],
        subject: Option<&str>,
    ) -> Result<String> {
        let messages = self.rephrase_messages(docs, message, history, subject);
        self.llm.complete(&messages, CompletionOptions::default()).await
    }

    pub async fn rephrase_message_stream(
        &self,
        docs: &[Document],
        message: &str,
        history: &[Message],
        subject: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let messages = self.rephrase_messages(docs, message, history, subject);
        self.llm.stream(&messages).await
    }

    async fn answer_messages(
        &self,
        query: &str,
        history: &[Message],
        docs: &[Document],
        subject: Option<&str>,
    ) -> Result<Vec<Message>> {
        let iso_code = self.detect_language(query).await?;
        let cursus = subject.unwrap_or(DEFAULT_CURSUS);

        let mut messages = vec![Message::system(fill(prompts::SYSTEM_PROMPT, &[("cursus", cursus)]))];
        messages.extend_from_slice(history);
        messages.push(Message::user(fill(
            prompts::SOURCED_ANSWER,
            &[
                ("documents", &stringify_docs_content(docs)),
                ("query", query),
                ("ISO_CODE", &iso_code),
            ],
        )));
        Ok(messages)
    }

    /// Answer the query from the given sources, in the query's language.
    pub async fn chat_message(
        &self,
        query: &str,
        history: &[Message],
        docs: &[Document],
        subject: Option<&str>,
    ) -> Result<String> {
        let messages = self.answer_messages(query, history, docs, subject).await?;
        self.llm.complete(&messages, CompletionOptions::default()).await
    }

    pub async fn chat_message_stream(
        &self,
        query: &str,
        history: &[Message],
        docs: &[Document],
        subject: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let messages = self.answer_messages(query, history, docs, subject).await?;
        self.llm.stream(&messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatTurn, ScriptedLlm};
    use futures::StreamExt;
    use welearn_core::models::Role;

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("u{}", i))
                } else {
                    Message::assistant(format!("a{}", i))
                }
            })
            .collect()
    }

    fn sent(llm: &ScriptedLlm, call: usize) -> Vec<Message> {
        llm.requests()[call]
            .iter()
            .filter_map(|t| match t {
                ChatTurn::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    const EN_QUERY: &str = "How can cities reduce their carbon emissions?";

    #[tokio::test]
    async fn test_detect_language_falls_back_to_llm() {
        let llm = Arc::new(ScriptedLlm::new().reply(r#"{"ISO_CODE": "FR"}"#).reply(r#"{"ISO_CODE": "es"}"#));
        let chat = ChatService::new(llm.clone());

        assert_eq!(chat.detect_language(EN_QUERY).await.unwrap(), "en");
        assert!(llm.requests().is_empty());

        assert_eq!(chat.detect_language("2030 ?").await.unwrap(), "fr");
        let err: ApiError = chat.detect_language("2030 ?").await.unwrap_err().into();
        assert_eq!(err.code(), "LANG_NOT_SUPPORTED");
    }

    #[tokio::test]
    async fn test_reformulate_ref_to_past() {
        let llm = Arc::new(ScriptedLlm::new().reply(r#"{"REF_TO_PAST": true}"#).reply(r#"{"REF_TO_PAST": true}"#));
        let chat = ChatService::new(llm.clone());

        let r = chat.reformulate_user_query("and the second one?", &history(3)).await.unwrap();
        assert_eq!(r.query_status, Some(QueryStatus::RefToPast));
        assert_eq!(r.standalone_question_en.as_deref(), Some("and the second one?"));
        // history[..len-2] between the system prompt and the query
        assert_eq!(sent(&llm, 0).len(), 3);

        let r = chat.reformulate_user_query("and the second one?", &[]).await.unwrap();
        assert_eq!(r.query_status, Some(QueryStatus::Invalid));
    }

    #[tokio::test]
    async fn test_reformulate_parses_embedded_json() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .reply("not json")
                .reply("Sure! {\"STANDALONE_QUESTION_EN\": \"q en\", \"STANDALONE_QUESTION_FR\": \"q fr\", \"USER_LANGUAGE\": \"en\", \"QUERY_STATUS\": \"VALID\"}"),
        );
        let chat = ChatService::new(llm.clone());
        let r = chat.reformulate_user_query(EN_QUERY, &history(7)).await.unwrap();
        assert_eq!(r.standalone_question_fr.as_deref(), Some("q fr"));
        assert_eq!(r.query_status, Some(QueryStatus::Valid));
        // system + history[..2] + user
        let msgs = sent(&llm, 1);
        assert_eq!(msgs.len(), 4);
        assert!(msgs[3].content.ends_with(EN_QUERY));
    }

    #[tokio::test]
    async fn test_reformulate_failure_code() {
        let llm = Arc::new(ScriptedLlm::new().reply("{}").reply("no object here"));
        let chat = ChatService::new(llm);
        let err: ApiError = chat.reformulate_user_query(EN_QUERY, &[]).await.unwrap_err().into();
        assert_eq!(err.code(), "REFORMULATE_ERROR");
    }

    #[tokio::test]
    async fn test_new_questions_split_and_history_window() {
        let llm = Arc::new(ScriptedLlm::new().reply("What is SDG 13? %% %%How to act locally?%%"));
        let chat = ChatService::new(llm.clone());
        let r = chat.get_new_questions(EN_QUERY, &history(5)).await.unwrap();
        assert_eq!(r.new_questions, vec!["What is SDG 13?", "How to act locally?"]);

        let msgs = sent(&llm, 0);
        assert_eq!(msgs[0].content, "u4");
        assert_eq!(msgs[1].content, "u2");
        assert_eq!(msgs[2].role, Role::User);
    }

    #[tokio::test]
    async fn test_rephrase_window_and_cursus() {
        let llm = Arc::new(ScriptedLlm::new().reply("rephrased"));
        let chat = ChatService::new(llm.clone());
        let out = chat
            .rephrase_message(&[], "previous answer", &history(8), Some("Physics"))
            .await
            .unwrap();
        assert_eq!(out, "rephrased");

        let msgs = sent(&llm, 0);
        assert!(msgs[0].content.contains("Physics"));
        let window: Vec<&str> = msgs[1..msgs.len() - 1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(window, vec!["a3", "u4", "a5", "u6"]);
        assert!(msgs.last().unwrap().content.contains("previous answer"));
    }

    #[tokio::test]
    async fn test_chat_message_stream() {
        let llm = Arc::new(ScriptedLlm::new().reply("Cities can invest in transit."));
        let chat = ChatService::new(llm.clone());
        let chunks: Vec<String> = chat
            .chat_message_stream(EN_QUERY, &history(2), &[], None)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat(), "Cities can invest in transit.");

        let msgs = sent(&llm, 0);
        assert_eq!(msgs.len(), 4);
        assert!(msgs[0].content.contains("General"));
        assert!(msgs[3].content.contains("Language: en"));
    }
}
