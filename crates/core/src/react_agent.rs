//! ReAct (Reasoning + Acting) loop.
//!
//! Drives one conversation with the LLM, calling tools until either an
//! `<ANSWER>` appears or the budget/loop limit forces synthesis. Tool-call
//! parsing is intentionally permissive (§4.8, §9 design notes) since LLM
//! output is free-form and non-deterministic.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::context::SearchContext;
use crate::llm::{extract_tag, LlmClient, Message};
use crate::prompts;
use crate::tools::ToolRegistry;

const OBSERVATION_TRUNCATE_CHARS: usize = 8_000;

pub struct ReActAgent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
}

#[derive(Debug)]
pub struct ReActOutcome {
    pub answer: String,
    pub forced: bool,
}

impl ReActAgent {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        Self { llm, tools }
    }

    pub async fn run(
        &self,
        query: &str,
        ctx: &Mutex<SearchContext>,
        initial_keywords: Option<Vec<String>>,
    ) -> crate::error::Result<ReActOutcome> {
        let tool_descriptions = self
            .tools
            .get_all_schemas()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let (budget_remaining, files_read, search_count, loop_count, max_loops) = snapshot(ctx).await;
        let system_prompt =
            prompts::react_system_prompt(&tool_descriptions, budget_remaining, files_read, search_count, loop_count, max_loops);

        let mut conversation = vec![Message::system(system_prompt), Message::user(query.to_string())];

        // Preseed: inject a known-good first move at zero LLM cost.
        if let Some(keywords) = initial_keywords {
            if !keywords.is_empty() && self.tools.get("keyword_search").is_some() {
                let args = serde_json::json!({"keywords": keywords});
                let (observation, _meta) = self.tools.execute("keyword_search", ctx, args.clone()).await;
                conversation.push(Message::assistant(format!(
                    "{{\"tool\": \"keyword_search\", \"arguments\": {args}}}"
                )));
                conversation.push(Message::user(format!("**Tool result** (keyword_search): {observation}")));
            }
        }

        loop {
            let should_force = {
                let guard = ctx.lock().await;
                guard.is_budget_exceeded() || guard.is_loop_limit_reached()
            };
            if should_force {
                return self.force_synthesis(&mut conversation, ctx).await;
            }

            ctx.lock().await.increment_loop();

            let response = self.llm.chat(&conversation).await?;
            {
                let mut guard = ctx.lock().await;
                guard.add_llm_tokens(response.total_tokens(), response.usage.clone());
            }
            conversation.push(Message::assistant(response.content.clone()));

            if let Some(answer) = extract_tag(&response.content, "ANSWER") {
                return Ok(ReActOutcome { answer, forced: false });
            }

            if let Some((tool_name, args)) = parse_tool_call(&response.content) {
                let (observation, _meta) = self.tools.execute(&tool_name, ctx, args).await;
                let truncated = truncate_observation(&observation);

                let (budget_remaining, files_read, search_count, loop_count, max_loops) = snapshot(ctx).await;
                let continuation = prompts::react_continuation_prompt(
                    budget_remaining,
                    files_read,
                    search_count,
                    loop_count,
                    max_loops,
                );
                conversation.push(Message::user(format!(
                    "**Tool result** ({tool_name}): {truncated}\n\n{continuation}"
                )));
            } else {
                conversation.push(Message::user(prompts::nudge_prompt().to_string()));
            }
        }
    }

    async fn force_synthesis(
        &self,
        conversation: &mut Vec<Message>,
        ctx: &Mutex<SearchContext>,
    ) -> crate::error::Result<ReActOutcome> {
        conversation.push(Message::user(prompts::force_synthesis_prompt().to_string()));
        let response = self.llm.chat(conversation).await?;
        {
            let mut guard = ctx.lock().await;
            guard.add_llm_tokens(response.total_tokens(), response.usage.clone());
        }

        let answer = extract_tag(&response.content, "ANSWER").unwrap_or(response.content);
        Ok(ReActOutcome { answer, forced: true })
    }
}

async fn snapshot(ctx: &Mutex<SearchContext>) -> (u32, usize, usize, u32, u32) {
    let guard = ctx.lock().await;
    (
        guard.budget_remaining(),
        guard.read_file_ids().len(),
        guard.search_history().len(),
        guard.loop_count(),
        guard.max_loops,
    )
}

fn truncate_observation(text: &str) -> String {
    if text.chars().count() <= OBSERVATION_TRUNCATE_CHARS {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(OBSERVATION_TRUNCATE_CHARS).collect();
        truncated.push_str("\n... [output truncated]");
        truncated
    }
}

/// Best-effort tool-call parse over free-form LLM text, tried in order:
/// (1) a ```json fenced code block, (2) a balanced `{...}` object keyed by
/// `tool`/`name`, (3) `tool_name({...})` function-call syntax.
fn parse_tool_call(text: &str) -> Option<(String, Value)> {
    parse_fenced_json(text).or_else(|| parse_balanced_json(text)).or_else(|| parse_function_call_syntax(text))
}

fn parse_fenced_json(text: &str) -> Option<(String, Value)> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    let candidate = rest[..end].trim();
    extract_tool_and_args(&serde_json::from_str(candidate).ok()?)
}

fn parse_balanced_json(text: &str) -> Option<(String, Value)> {
    let bytes: Vec<char> = text.chars().collect();
    for (i, &c) in bytes.iter().enumerate() {
        if c != '{' {
            continue;
        }
        let mut depth = 0i32;
        for (j, &c2) in bytes[i..].iter().enumerate() {
            match c2 {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate: String = bytes[i..i + j + 1].iter().collect();
                        if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
                            if let Some(result) = extract_tool_and_args(&value) {
                                return Some(result);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn parse_function_call_syntax(text: &str) -> Option<(String, Value)> {
    let re = regex::Regex::new(r"(\w+)\((\{.*\})\)").ok()?;
    let caps = re.captures(text)?;
    let name = caps.get(1)?.as_str().to_string();
    let args: Value = serde_json::from_str(caps.get(2)?.as_str()).ok()?;
    Some((name, args))
}

fn extract_tool_and_args(value: &Value) -> Option<(String, Value)> {
    let name = value.get("tool").or_else(|| value.get("name")).and_then(|v| v.as_str())?;
    let args = value
        .get("arguments")
        .or_else(|| value.get("args"))
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    Some((name.to_string(), args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_json_tool_call() {
        let text = "Let me search.\n```json\n{\"tool\": \"keyword_search\", \"arguments\": {\"keywords\": [\"foo\"]}}\n```";
        let (name, args) = parse_tool_call(text).unwrap();
        assert_eq!(name, "keyword_search");
        assert_eq!(args["keywords"][0], "foo");
    }

    #[test]
    fn parses_balanced_json_with_name_key() {
        let text = "I'll call {\"name\": \"file_read\", \"args\": {\"file_paths\": [\"a.txt\"]}} now.";
        let (name, args) = parse_tool_call(text).unwrap();
        assert_eq!(name, "file_read");
        assert_eq!(args["file_paths"][0], "a.txt");
    }

    #[test]
    fn parses_function_call_syntax() {
        let text = "dir_scan({\"query\": \"budgets\", \"top_k\": 5})";
        let (name, args) = parse_tool_call(text).unwrap();
        assert_eq!(name, "dir_scan");
        assert_eq!(args["query"], "budgets");
    }

    #[test]
    fn no_tool_call_returns_none() {
        assert!(parse_tool_call("just some plain prose").is_none());
    }

    #[test]
    fn truncate_observation_appends_marker_when_over_limit() {
        let text = "x".repeat(9000);
        let truncated = truncate_observation(&text);
        assert!(truncated.ends_with("[output truncated]"));
        assert!(truncated.chars().count() < text.chars().count());
    }

    #[test]
    fn truncate_observation_leaves_short_text_untouched() {
        assert_eq!(truncate_observation("short"), "short");
    }
}
