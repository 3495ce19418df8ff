//! Prompt template functions.
//!
//! Expressed as `format!`-based functions rather than `.format()`-style
//! Python string templates (the source's `REACT_SYSTEM_PROMPT` /
//! `REACT_CONTINUATION_PROMPT` / `DIR_SCAN_ANALYSIS_PROMPT`), carrying the
//! same placeholders named in §6.4: `{user_input}`, `{evidences}`,
//! `{tool_descriptions}`, `{budget_remaining}`, and the tagged answer
//! markers consumed by `llm::extract_tag`.

pub fn react_system_prompt(
    tool_descriptions: &str,
    budget_remaining: u32,
    files_read: usize,
    search_count: usize,
    loop_count: u32,
    max_loops: u32,
) -> String {
    format!(
        "You are a research agent answering questions by investigating local files.\n\
         You have the following tools available:\n\n{tool_descriptions}\n\n\
         Strategy:\n\
         - Start broad (keyword_search, dir_scan) before reading full files.\n\
         - Prefer knowledge_query first if a cached answer may already exist.\n\
         - Read only the files that look relevant; do not re-read a file already consumed.\n\
         - Stop and answer as soon as you have enough evidence.\n\n\
         Current budget: {budget_remaining} tokens remaining.\n\
         Progress so far: loop {loop_count}/{max_loops}, {files_read} files read, {search_count} searches issued.\n\n\
         To call a tool, respond with a JSON object: {{\"tool\": \"<name>\", \"arguments\": {{...}}}}.\n\
         When you have a final answer, wrap it in <ANSWER>...</ANSWER> tags and stop."
    )
}

pub fn react_continuation_prompt(
    budget_remaining: u32,
    files_read: usize,
    search_count: usize,
    loop_count: u32,
    max_loops: u32,
) -> String {
    format!(
        "Budget remaining: {budget_remaining} tokens. Loop {loop_count}/{max_loops}. \
         Files read so far: {files_read}. Searches issued so far: {search_count}.\n\
         Continue investigating, call another tool, or give your final answer wrapped in <ANSWER>...</ANSWER>."
    )
}

pub fn force_synthesis_prompt() -> &'static str {
    "Your investigation budget or loop limit has been reached. Based on everything gathered \
     so far, synthesise the best possible answer now. Wrap it in <ANSWER>...</ANSWER>."
}

pub fn nudge_prompt() -> &'static str {
    "Your last response contained neither a tool call nor a final <ANSWER>. \
     Either call one of the listed tools with valid JSON arguments, or provide \
     your final answer wrapped in <ANSWER>...</ANSWER>."
}

pub fn dir_scan_analysis_prompt(query: &str, digest: &str) -> String {
    format!(
        "Given the query \"{query}\", judge the relevance of each of the following files.\n\
         Respond with a JSON array: [{{\"path\": str, \"relevance\": \"high\"|\"medium\"|\"low\", \"reason\": str}}].\n\n{digest}"
    )
}

pub fn evidence_summary_prompt(user_input: &str, evidences: &str) -> String {
    format!(
        "A user asked: \"{user_input}\"\n\n\
         The following evidence was extracted from local files:\n\n{evidences}\n\n\
         Synthesise a concise, reusable knowledge unit from this evidence. Respond with:\n\
         <NAME>short title</NAME>\n<DESCRIPTION>one or two sentences</DESCRIPTION>\n<CONTENT>the synthesised answer</CONTENT>"
    )
}

pub fn search_result_summary_prompt(user_input: &str, text_content: &str) -> String {
    format!(
        "A user asked: \"{user_input}\"\n\nRelevant content:\n\n{text_content}\n\n\
         Summarise an answer to the user's question from this content. Respond with:\n\
         <SUMMARY>your answer</SUMMARY>\n<SHOULD_SAVE>true|false</SHOULD_SAVE>"
    )
}

pub fn detect_doc_intent_prompt(query: &str) -> String {
    format!(
        "Classify this query as either a whole-document operation (summarise, translate, \
         extract-all-of, compare-documents) or a targeted lookup. Query: \"{query}\"\n\
         Respond with a single word: DOCUMENT or LOOKUP."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn react_system_prompt_contains_budget_and_tool_descriptions() {
        let prompt = react_system_prompt("keyword_search: ...", 5000, 2, 3, 1, 10);
        assert!(prompt.contains("5000 tokens remaining"));
        assert!(prompt.contains("keyword_search: ..."));
        assert!(prompt.contains("loop 1/10"));
    }

    #[test]
    fn continuation_prompt_restates_counters() {
        let prompt = react_continuation_prompt(100, 4, 2, 3, 10);
        assert!(prompt.contains("Budget remaining: 100"));
        assert!(prompt.contains("Loop 3/10"));
    }

    #[test]
    fn evidence_summary_prompt_embeds_user_input_and_evidence() {
        let prompt = evidence_summary_prompt("what is x?", "evidence block");
        assert!(prompt.contains("what is x?"));
        assert!(prompt.contains("evidence block"));
    }
}
