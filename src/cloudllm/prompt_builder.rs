//! Deterministic system/user prompt assembly (§4.2).
//!
//! Stateless: every function takes its inputs by reference and returns a freshly built `String`.
//! Identical inputs produce byte-identical output, the same determinism the teacher's
//! `augment_system_prompt` relies on for ordered fragment joining — generalized here from a single
//! fragment list to five prompt variants sharing formatter building blocks.

use serde_json::Value;

use crate::cloudllm::types::{ChatContext, ExecutionContext, SchemaParameter, SubAgentCatalog, ToolDefinition};

const TIER1_INVESTIGATION: &str = "## General SRE Agent Instructions\n\nYou are an automated SRE investigation agent. \
Use the tools available to you to gather evidence before drawing conclusions. Cite what you observed.";
const TIER1_SYNTHESIS: &str = "You are a synthesis agent. Combine the findings from parallel investigation stages \
into one coherent analysis.";
const TIER1_CHAT: &str = "## Chat Assistant Instructions\n\nYou are a conversational follow-up agent for an existing \
incident investigation. Answer the user's question using the investigation context already gathered.";
const TIER1_ORCHESTRATOR: &str = "You are an orchestrating agent. Dispatch work to sub-agents and synthesize their \
results into a final analysis.";

/// Joins non-empty fragments with a single blank line, the shared assembly primitive behind
/// every prompt variant.
fn join_fragments(fragments: &[String]) -> String {
    fragments.iter().filter(|f| !f.is_empty()).cloned().collect::<Vec<_>>().join("\n\n")
}

fn tier2_server_instructions(ctx: &ExecutionContext, server_instructions: &[(String, String)]) -> String {
    let mut sections = Vec::new();
    for server_id in &ctx.config.tool_servers {
        if let Some((_, instructions)) = server_instructions.iter().find(|(id, _)| id == server_id) {
            if !instructions.is_empty() {
                sections.push(format!("## {} Instructions\n\n{}", server_id, instructions));
            }
        }
    }
    sections.join("\n\n")
}

fn unavailable_servers_warning(ctx: &ExecutionContext) -> String {
    if ctx.failed_servers.is_empty() {
        return String::new();
    }
    let mut ids: Vec<&String> = ctx.failed_servers.keys().collect();
    ids.sort();
    let bullets: Vec<String> = ids.iter().map(|id| format!("- {}: {}", id, ctx.failed_servers[*id])).collect();
    format!("## Unavailable Tool Servers\n\n{}", bullets.join("\n"))
}

fn tier3_custom_instructions(custom_instructions: &str) -> String {
    if custom_instructions.is_empty() {
        String::new()
    } else {
        format!("## Agent-Specific Instructions\n\n{}", custom_instructions)
    }
}

/// System prompt for the investigation variant (§4.2 "Shared structure — system message").
pub fn investigation_system_prompt(ctx: &ExecutionContext, server_instructions: &[(String, String)]) -> String {
    join_fragments(&[
        TIER1_INVESTIGATION.to_string(),
        tier2_server_instructions(ctx, server_instructions),
        unavailable_servers_warning(ctx),
        tier3_custom_instructions(&ctx.config.custom_instructions),
        "Focus on gathering evidence relevant to the alert before producing a final analysis.".to_string(),
    ])
}

/// System prompt for the synthesis variant. Makes no reference to tools and omits the
/// investigation task-focus line (§4.5 "Synthesis agent").
pub fn synthesis_system_prompt(ctx: &ExecutionContext, native_tools: &[String]) -> String {
    let mut fragments = vec![TIER1_SYNTHESIS.to_string(), tier3_custom_instructions(&ctx.config.custom_instructions)];
    if native_tools.iter().any(|t| t == "google_search" || t == "url_context") {
        fragments.push(
            "When the provided results reference claims that would benefit from a web search, note the \
uncertainty rather than fabricating a source."
                .to_string(),
        );
    }
    join_fragments(&fragments)
}

/// System prompt for the chat variant, appending a "Response Guidelines" block (§4.2).
pub fn chat_system_prompt(ctx: &ExecutionContext) -> String {
    join_fragments(&[
        TIER1_CHAT.to_string(),
        tier3_custom_instructions(&ctx.config.custom_instructions),
        "## Response Guidelines\n\nBe concise. Reference the investigation context directly; do not re-investigate \
unless the user asks for new evidence."
            .to_string(),
    ])
}

/// System prompt for the orchestrator variant: sub-agent catalog + result-delivery protocol +
/// orchestrator task focus (§4.2).
pub fn orchestrator_system_prompt(ctx: &ExecutionContext, catalog: &SubAgentCatalog, server_instructions: &[(String, String)]) -> String {
    join_fragments(&[
        TIER1_ORCHESTRATOR.to_string(),
        tier2_server_instructions(ctx, server_instructions),
        unavailable_servers_warning(ctx),
        tier3_custom_instructions(&ctx.config.custom_instructions),
        sub_agent_catalog_block(catalog),
        "## Result Delivery\n\nResults from dispatched sub-agents arrive as user messages prefixed `[Sub-agent \
completed]` or `[Sub-agent failed/cancelled]`. You do not need to poll; if you call no tool and have \
pending dispatches, you will be resumed automatically once a result arrives."
            .to_string(),
        "Dispatch work in parallel where possible, then synthesize the sub-agent results into one final analysis."
            .to_string(),
    ])
}

/// Sub-agent catalog block, bulleted by entry (§4.2 "Sub-agent catalog" formatter).
fn sub_agent_catalog_block(catalog: &SubAgentCatalog) -> String {
    if catalog.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Available Sub-Agents".to_string()];
    for entry in catalog {
        let tools = if !entry.mcp_tool_servers.is_empty() {
            format!("MCP tools: {}", entry.mcp_tool_servers.join(", "))
        } else if !entry.native_tools.is_empty() {
            format!("Native tools: {}", entry.native_tools.join(", "))
        } else {
            "Tools: none (pure reasoning)".to_string()
        };
        lines.push(format!("- {}: {} ({})", entry.name, entry.description, tools));
    }
    lines.join("\n")
}

/// Alert section (§4.2 "Section formatters"). `include_type` is `false` for the synthesis variant.
pub fn alert_section(ctx: &ExecutionContext, include_type: bool) -> String {
    let mut lines = vec!["## Alert Details".to_string()];
    if include_type {
        if let Some(alert_type) = &ctx.alert_type {
            lines.push(format!("Type: {}", alert_type));
        }
    }
    match ctx.alert_payload_as_text() {
        Some(text) if !text.is_empty() => {
            lines.push(format!("<!-- ALERT_DATA_START -->\n{}\n<!-- ALERT_DATA_END -->", text));
        }
        _ => lines.push("No additional alert data provided.".to_string()),
    }
    lines.join("\n\n")
}

/// Runbook section (§4.2).
pub fn runbook_section(runbook: &str) -> String {
    if runbook.is_empty() {
        "No runbook available.".to_string()
    } else {
        format!("<!-- RUNBOOK START -->\n```markdown\n{}\n```\n<!-- RUNBOOK END -->", runbook)
    }
}

/// Chain-context section (§4.2).
pub fn chain_context_section(chain_context: &str) -> String {
    if chain_context.is_empty() {
        "This is the first stage of analysis.".to_string()
    } else {
        format!("## Previous Stage Data\n\n{}", chain_context)
    }
}

/// User message for the investigation variant.
pub fn investigation_user_prompt(ctx: &ExecutionContext) -> String {
    join_fragments(&[
        alert_section(ctx, true),
        runbook_section(&ctx.runbook),
        chain_context_section(&ctx.chain_context),
        "## Analysis Task\n\nInvestigate the alert above and produce a final analysis, citing the evidence you \
gathered."
            .to_string(),
    ])
}

/// User message for the synthesis variant: alert (type omitted) + runbook + parallel-results block.
pub fn synthesis_user_prompt(ctx: &ExecutionContext, parallel_results: &str) -> String {
    join_fragments(&[
        alert_section(ctx, false),
        runbook_section(&ctx.runbook),
        format!("## Parallel Stage Results\n\n{}", parallel_results),
        "## Synthesis Task\n\nCombine the results above into one coherent final analysis.".to_string(),
    ])
}

/// User message for the chat variant.
pub fn chat_user_prompt(chat_ctx: &ChatContext) -> String {
    let mut fragments = vec![chat_ctx.investigation_context.clone()];
    if !chat_ctx.history.is_empty() {
        let mut lines = vec!["## Prior Exchanges".to_string()];
        for (question, answer) in &chat_ctx.history {
            lines.push(format!("Q: {}\nA: {}", question, answer));
        }
        fragments.push(lines.join("\n\n"));
    }
    fragments.push(format!("## Current Question\n\n{}", chat_ctx.user_question));
    join_fragments(&fragments)
}

/// User message for the sub-agent variant: bare task block, no alert/runbook/chain context.
pub fn sub_agent_user_prompt(task: &str) -> String {
    format!("## Task\n\n{}", task)
}

/// Forced-conclusion prompt, injected on the final iteration (§4.5 step 2, §4.2).
pub fn forced_conclusion_prompt(iteration: u32, variant_trailing_instruction: &str) -> String {
    format!(
        "You have reached iteration {} of the available budget. Produce a final answer now without \
requesting any further tool use. {}",
        iteration, variant_trailing_instruction
    )
}

/// Tool catalog, numbered, with JSON-Schema parameters rendered alphabetically (§4.2).
pub fn tool_catalog_block(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Available Tools".to_string()];
    for (idx, tool) in tools.iter().enumerate() {
        lines.push(format!("{}. {} — {}", idx + 1, tool.name, tool.description));
        lines.push(format!("   Parameters: {}", render_schema_parameters(&tool.parameters_schema)));
    }
    lines.join("\n")
}

fn render_schema_parameters(schema_text: &str) -> String {
    let parsed: Value = match serde_json::from_str(schema_text) {
        Ok(v) => v,
        Err(_) => return "None".to_string(),
    };
    let params = extract_schema_parameters(&parsed);
    if params.is_empty() {
        return "None".to_string();
    }
    params
        .iter()
        .map(|p| {
            let required = if p.required { "required" } else { "optional" };
            let mut text = format!("{} ({}, {}): {}", p.name, required, p.param_type, p.description);
            if let Some(default) = &p.default {
                text.push_str(&format!(" [default: {}]", default));
            }
            if let Some(choices) = &p.choices {
                let rendered: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
                text.push_str(&format!(" choices: [{}]", rendered.join(", ")));
            }
            text
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Extracts [`SchemaParameter`]s from a JSON-Schema object, sorted alphabetically by name.
fn extract_schema_parameters(schema: &Value) -> Vec<SchemaParameter> {
    let properties = match schema.get("properties").and_then(Value::as_object) {
        Some(props) => props,
        None => return Vec::new(),
    };
    let required: Vec<&str> = schema.get("required").and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_str).collect()).unwrap_or_default();

    let mut names: Vec<&String> = properties.keys().collect();
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let prop = &properties[name];
            SchemaParameter {
                name: name.clone(),
                required: required.contains(&name.as_str()),
                param_type: prop.get("type").and_then(Value::as_str).unwrap_or("any").to_string(),
                description: prop.get("description").and_then(Value::as_str).unwrap_or("").to_string(),
                default: prop.get("default").cloned(),
                choices: prop.get("enum").and_then(Value::as_array).cloned(),
            }
        })
        .collect()
}

/// MCP-result summarization prompt: system + user templates (§4.2 "Utility prompts").
pub fn mcp_result_summary_prompt(server: &str, tool: &str, max_tokens: u32, conversation_context: &str, result_text: &str) -> (String, String) {
    let system = format!(
        "You summarize raw tool output from MCP server '{}' tool '{}' to fit within a {}-token budget while \
preserving every fact relevant to the ongoing investigation.",
        server, tool, max_tokens
    );
    let user = format!("## Conversation Context\n\n{}\n\n## Raw Result\n\n{}", conversation_context, result_text);
    (system, user)
}

/// Executive-summary prompt: system + user templates over a final-analysis text (§4.2).
pub fn executive_summary_prompt(final_analysis: &str) -> (String, String) {
    let system = "Produce a two-to-three sentence executive summary of the investigation below, suitable for a \
status page.".to_string();
    let user = final_analysis.to_string();
    (system, user)
}
