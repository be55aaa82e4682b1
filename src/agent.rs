//! Conversational agent with a single retrieval tool.
//!
//! ```text
//! user query ─▶ LLM ──tool call──▶ search_handler ──▶ tool result ─┐
//!               ▲                                                 │
//!               └─────────────────────────────────────────────────┘
//!               (until the model answers or max_steps is reached)
//! ```
//!
//! Each thread keeps its own trimmed message history in memory. Runs on the
//! same thread are serialized by that thread's lock, and the least recently
//! used thread is evicted once `agent.max_threads` are stored.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use welearn_core::models::{
    AgentContext, AgentResponse, Document, EnhancedSearchQuery, Message, Role, ScoredPoint,
    SearchMethod,
};
use welearn_core::prompts::{fill, stringify_docs_content, SYSTEM_PROMPT};

use crate::config::AgentConfig;
use crate::error::ApiError;
use crate::llm::{ChatTurn, LlmClient, ToolSpec};
use crate::search::SearchService;

pub const RESOURCES_TOOL: &str = "get_resources_about_sustainability";
const NO_DOCUMENTS: &str = "No relevant documents found.";
const TOOL_DOCS_LIMIT: usize = 7;

const AGENT_INSTRUCTIONS: &str = "Use the get_resources_about_sustainability tool to find articles before answering questions about sustainability. Only cite articles returned by the tool.";

#[derive(Debug, Deserialize)]
struct ResourcesArgs {
    rag_query: String,
}

type History = Arc<Mutex<Vec<Message>>>;

struct ThreadSlot {
    history: History,
    last_used: Instant,
}

pub struct ConversationalAgent {
    llm: Arc<dyn LlmClient>,
    search: Arc<SearchService>,
    config: AgentConfig,
    threads: Mutex<HashMap<String, ThreadSlot>>,
}

fn resources_tool() -> ToolSpec {
    ToolSpec {
        name: RESOURCES_TOOL.to_string(),
        description: "Get relevant resources about sustainability from WeLearn database."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "rag_query": {
                    "type": "string",
                    "description": "The query string to search for relevant resources."
                }
            },
            "required": ["rag_query"]
        }),
    }
}

/// Keep the last `max` messages, then drop leading messages until the
/// window starts on a user message.
pub fn trim_history(history: &[Message], max: usize) -> Vec<Message> {
    let tail = &history[history.len().saturating_sub(max)..];
    tail.iter()
        .skip_while(|m| m.role != Role::User)
        .cloned()
        .collect()
}

impl ConversationalAgent {
    pub fn new(llm: Arc<dyn LlmClient>, search: Arc<SearchService>, config: AgentConfig) -> Self {
        Self {
            llm,
            search,
            config,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// History of `thread_id`, created (and the oldest thread evicted when
    /// full) on first use.
    async fn thread(&self, thread_id: &str) -> History {
        let mut threads = self.threads.lock().await;
        if let Some(slot) = threads.get_mut(thread_id) {
            slot.last_used = Instant::now();
            return slot.history.clone();
        }
        if threads.len() >= self.config.max_threads {
            let oldest = threads
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(thread_id = %oldest, "evicting agent thread");
                threads.remove(&oldest);
            }
        }
        let history = History::default();
        threads.insert(
            thread_id.to_string(),
            ThreadSlot {
                history: history.clone(),
                last_used: Instant::now(),
            },
        );
        history
    }

    /// Search by slices and render at most seven documents for the model.
    async fn get_resources(
        &self,
        rag_query: &str,
        ctx: &AgentContext,
    ) -> Result<(String, Vec<ScoredPoint>)> {
        let mut qp = EnhancedSearchQuery::new(rag_query.to_string());
        qp.sdg_filter = ctx.sdg_filter.clone();
        qp.corpora = ctx.corpora.clone();
        let docs = self.search.search_handler(&qp, SearchMethod::BySlices).await?;
        if docs.is_empty() {
            warn!(rag_query, "No documents found for the query.");
            return Ok((NO_DOCUMENTS.to_string(), docs));
        }
        let rendered: Vec<Document> = docs
            .iter()
            .take(TOOL_DOCS_LIMIT)
            .map(Document::from_point)
            .collect();
        Ok((stringify_docs_content(&rendered), docs))
    }

    pub async fn run(&self, ctx: AgentContext) -> Result<AgentResponse> {
        let started = Instant::now();
        let query = match ctx.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return Err(ApiError::EmptyQuery.into()),
        };
        let thread_id = ctx
            .thread_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let thread = self.thread(&thread_id).await;
        let mut past = thread.lock().await;

        let system = format!(
            "{}\n{}",
            fill(SYSTEM_PROMPT, &[("cursus", "General")]).trim(),
            AGENT_INSTRUCTIONS
        );
        let mut turns: Vec<ChatTurn> = vec![ChatTurn::Message(Message::system(system))];
        let mut window = past.clone();
        window.push(Message::user(query.clone()));
        turns.extend(
            trim_history(&window, self.config.history_size)
                .into_iter()
                .map(ChatTurn::Message),
        );

        let tools = [resources_tool()];
        let mut docs: Vec<ScoredPoint> = Vec::new();
        let mut content: Option<String> = None;
        let mut steps = 0;

        while steps < self.config.max_steps {
            steps += 1;
            let reply = self.llm.complete_with_tools(&turns, &tools).await?;
            if reply.tool_calls.is_empty() {
                content = reply.content;
                break;
            }
            turns.push(ChatTurn::ToolRequest {
                content: reply.content.clone(),
                calls: reply.tool_calls.clone(),
            });
            for call in &reply.tool_calls {
                let output = if call.name != RESOURCES_TOOL {
                    warn!(tool = %call.name, "unknown tool requested");
                    format!("Unknown tool: {}", call.name)
                } else {
                    match serde_json::from_str::<ResourcesArgs>(&call.arguments) {
                        Ok(args) => {
                            info!(rag_query = %args.rag_query, "agent tool call");
                            match self.get_resources(&args.rag_query, &ctx).await {
                                Ok((text, found)) => {
                                    docs.extend(found);
                                    text
                                }
                                Err(e) => {
                                    warn!(error = %e, "agent tool failed");
                                    NO_DOCUMENTS.to_string()
                                }
                            }
                        }
                        Err(e) => format!("Invalid arguments: {}", e),
                    }
                };
                turns.push(ChatTurn::ToolResult {
                    call_id: call.id.clone(),
                    content: output,
                });
            }
        }

        if content.is_none() {
            warn!(steps, "agent step limit reached, asking for a final answer");
            content = self.llm.complete_with_tools(&turns, &[]).await?.content;
        }

        window.push(Message::assistant(content.clone().unwrap_or_default()));
        *past = trim_history(&window, self.config.history_size * 2);
        drop(past);

        info!(
            %thread_id,
            steps,
            docs = docs.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "agent run"
        );
        Ok(AgentResponse {
            content,
            docs: Some(docs),
            thread_id,
        })
    }
}
