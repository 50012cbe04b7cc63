use rev_provider::{
    ChatRequest, ContentPart, LmClient, Message, MessageContent, Role, ToolChoice,
};

use crate::context::SessionContext;
use crate::events::{EventSender, RunEvent};
use crate::failure::{Failure, FailureKind};
use crate::orchestrator::loop_guard::LoopGuard;
use crate::task::{Task, ToolEvent};
use crate::tools::{ToolContext, ToolRegistry};

/// The sub-agent family. Roles differ by system prompt, tool subset,
/// completion sentinel, and the hint used to recover from schema errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    CodeWriter,
    Refactoring,
    TestExecutor,
    Debugging,
    Documentation,
    Research,
    Analysis,
}

pub struct AgentProfile {
    pub kind: AgentKind,
    pub name: &'static str,
    pub system_prompt: &'static str,
    pub allowed_tools: &'static [&'static str],
    pub sentinel: &'static str,
    /// Appended to schema-error feedback so the model can correct shape.
    pub schema_hint: &'static str,
}

const READ_TOOLS: &[&str] = &["read_file", "list_dir", "search_files"];
const WRITE_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "append_file",
    "delete_file",
    "move_file",
    "list_dir",
    "search_files",
];
const ALL_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "append_file",
    "delete_file",
    "move_file",
    "list_dir",
    "search_files",
    "run_cmd",
    "run_tests",
];
const TEST_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "edit_file",
    "list_dir",
    "search_files",
    "run_cmd",
    "run_tests",
];

impl AgentKind {
    pub fn profile(&self) -> AgentProfile {
        match self {
            AgentKind::CodeWriter => AgentProfile {
                kind: *self,
                name: "code-writer",
                system_prompt: "You are a code-writing agent. Implement exactly what the task \
                    describes using the tools provided. Read before you write, keep diffs \
                    minimal, and prefer editing existing files over creating new ones. When \
                    the task is fully done, reply with the text TASK COMPLETE and a one-line \
                    summary.",
                allowed_tools: WRITE_TOOLS,
                sentinel: "TASK COMPLETE",
                schema_hint: "write_file needs {path, content}; edit_file needs {path, find, \
                    replace} where `find` must match exactly once and an empty `replace` \
                    deletes the fragment",
            },
            AgentKind::Refactoring => AgentProfile {
                kind: *self,
                name: "refactoring",
                system_prompt: "You are a refactoring agent. Restructure code without changing \
                    behavior: extract, move, and shrink. Keep every public interface working \
                    and update imports in dependent files. When done, reply REFACTOR COMPLETE \
                    with a summary of what moved where.",
                allowed_tools: ALL_TOOLS,
                sentinel: "REFACTOR COMPLETE",
                schema_hint: "move_file needs {source, destination}; edit_file needs {path, \
                    find, replace}",
            },
            AgentKind::TestExecutor => AgentProfile {
                kind: *self,
                name: "test-executor",
                system_prompt: "You are a testing agent. Write focused tests when the task asks \
                    for them and run the suite with run_tests. Report failures precisely with \
                    the failing output. When done, reply TESTS COMPLETE with the pass/fail \
                    counts.",
                allowed_tools: TEST_TOOLS,
                sentinel: "TESTS COMPLETE",
                schema_hint: "run_tests takes an optional {command}; write_file needs {path, \
                    content}",
            },
            AgentKind::Debugging => AgentProfile {
                kind: *self,
                name: "debugging",
                system_prompt: "You are a debugging agent. Reproduce the problem first, locate \
                    the cause by reading and searching, then apply the smallest fix and rerun \
                    the failing check. When fixed, reply DEBUG COMPLETE with the root cause.",
                allowed_tools: ALL_TOOLS,
                sentinel: "DEBUG COMPLETE",
                schema_hint: "edit_file needs {path, find, replace}; run_cmd needs {command}",
            },
            AgentKind::Documentation => AgentProfile {
                kind: *self,
                name: "documentation",
                system_prompt: "You are a documentation agent. Write accurate, concise docs that \
                    match the code as it exists now; read the code before describing it. When \
                    done, reply DOCS COMPLETE.",
                allowed_tools: WRITE_TOOLS,
                sentinel: "DOCS COMPLETE",
                schema_hint: "write_file needs {path, content}; append_file needs {path, content}",
            },
            AgentKind::Research => AgentProfile {
                kind: *self,
                name: "research",
                system_prompt: "You are a research agent with read-only access. Answer the \
                    question by reading and searching the repository; cite file paths for every \
                    claim. Reply RESEARCH COMPLETE followed by your findings.",
                allowed_tools: READ_TOOLS,
                sentinel: "RESEARCH COMPLETE",
                schema_hint: "search_files needs {pattern} with optional {glob}",
            },
            AgentKind::Analysis => AgentProfile {
                kind: *self,
                name: "analysis",
                system_prompt: "You are an analysis agent with read-only access plus command \
                    execution for linters and builds. Assess the code the task points at and \
                    report concrete findings with file references. Reply ANALYSIS COMPLETE \
                    followed by the findings.",
                allowed_tools: &[
                    "read_file",
                    "list_dir",
                    "search_files",
                    "run_cmd",
                ],
                sentinel: "ANALYSIS COMPLETE",
                schema_hint: "run_cmd needs {command} from the allowed prefix set",
            },
        }
    }
}

/// What a sub-agent run produced.
#[derive(Debug, Clone)]
pub struct SubAgentOutcome {
    pub result: String,
    pub iterations: u32,
    /// Set when the loop guard tripped: the orchestrator should replan
    /// instead of trusting further iterations.
    pub replan_hint: Option<String>,
}

pub struct SubAgentRunner<'a> {
    pub client: &'a LmClient,
    pub registry: &'a ToolRegistry,
    pub session: &'a SessionContext,
    pub events: EventSender,
    pub max_iterations: u32,
    pub loop_guard: Option<&'a LoopGuard>,
}

impl SubAgentRunner<'_> {
    /// The bounded LM⇄tool loop: prompt, enforce tools, dispatch calls,
    /// feed results back, stop on the sentinel or iteration exhaustion.
    pub async fn run(
        &self,
        kind: AgentKind,
        task: &mut Task,
        ctx: &ToolContext,
    ) -> Result<SubAgentOutcome, Failure> {
        let profile = kind.profile();
        let tool_defs = self.registry.definitions_filtered(profile.allowed_tools);

        let mut messages = vec![Message::user(self.task_prompt(&profile, task))];
        let mut schema_strikes = 0u32;
        let mut invariant_strikes = 0u32;

        for iteration in 1..=self.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(Failure::interrupted());
            }
            self.session.budgets.charge_step()?;

            let mut request = ChatRequest::new(self.client.default_model());
            request.system = Some(self.system_prompt(&profile));
            request.messages = messages.clone();
            request.tools = tool_defs.clone();
            request.tool_choice = ToolChoice::Enforced;
            request.stream = true;

            let response = self
                .client
                .chat_streaming(&request, |_| {})
                .await
                .map_err(|e| Failure::transport(format!("LM call failed: {e}")))?;
            if let Some(usage) = &response.usage {
                self.session.budgets.charge_tokens(usage.total());
            }

            if !response.has_tool_calls() {
                // Sentinel or plain text: either way the model is done
                // talking; with enforcement active this only happens on
                // the degradation path or at completion.
                return Ok(SubAgentOutcome {
                    result: response.text,
                    iterations: iteration,
                    replan_hint: None,
                });
            }

            let mut tool_use_parts = Vec::new();
            let mut tool_result_parts = Vec::new();
            for call in &response.tool_calls {
                if ctx.cancel.is_cancelled() {
                    return Err(Failure::interrupted());
                }
                self.session.budgets.charge_step()?;

                if let Some(guard) = self.loop_guard {
                    if guard.record(&call.name, &call.arguments) {
                        return Ok(SubAgentOutcome {
                            result: String::new(),
                            iterations: iteration,
                            replan_hint: Some(
                                "repeated identical tool calls detected; the goal may already \
                                 be achieved, verify before continuing"
                                    .to_string(),
                            ),
                        });
                    }
                }

                tool_use_parts.push(ContentPart::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
                let _ = self.events.send(RunEvent::ToolCallStarted {
                    task_id: task.id.clone(),
                    tool: call.name.clone(),
                });

                let started = std::time::Instant::now();
                let executed = self
                    .registry
                    .execute(&call.name, call.arguments.clone(), ctx)
                    .await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                let (content, ok, event) = match executed {
                    Ok(result) => {
                        let exit_code = result.payload.get("exit_code").and_then(|v| v.as_i64());
                        let event = ToolEvent {
                            tool: call.name.clone(),
                            paths: result.paths.clone(),
                            ok: true,
                            exit_code: exit_code.map(|c| c as i32),
                        };
                        (result.output, true, Some(event))
                    }
                    Err(failure) => match failure.kind {
                        FailureKind::Schema => {
                            schema_strikes += 1;
                            if schema_strikes > 1 {
                                return Err(failure);
                            }
                            let content = format!(
                                "{failure}\nExpected shape: {}",
                                profile.schema_hint
                            );
                            (content, false, None)
                        }
                        FailureKind::Invariant => {
                            invariant_strikes += 1;
                            if invariant_strikes > 1 {
                                return Err(failure);
                            }
                            (failure.to_string(), false, None)
                        }
                        // Tool errors go back to the model; it decides
                        // whether to retry with adjusted arguments.
                        _ => (failure.to_string(), false, None),
                    },
                };

                let _ = self.events.send(RunEvent::ToolCallFinished {
                    task_id: task.id.clone(),
                    tool: call.name.clone(),
                    ok,
                    elapsed_ms,
                });
                if let Some(event) = event {
                    task.tool_events.push(event);
                }
                tool_result_parts.push(ContentPart::ToolResult {
                    tool_use_id: call.id.clone(),
                    content,
                });
            }

            if !response.text.is_empty() && response.text.contains(profile.sentinel) {
                return Ok(SubAgentOutcome {
                    result: response.text,
                    iterations: iteration,
                    replan_hint: None,
                });
            }

            messages.push(Message {
                role: Role::Assistant,
                content: MessageContent::Parts(tool_use_parts),
            });
            messages.push(Message {
                role: Role::User,
                content: MessageContent::Parts(tool_result_parts),
            });
        }

        Err(Failure::tool(format!(
            "sub-agent hit the per-task iteration budget ({})",
            self.max_iterations
        ))
        .with_hint("the task may be too large; consider splitting it"))
    }

    fn system_prompt(&self, profile: &AgentProfile) -> String {
        let mut prompt = profile.system_prompt.to_string();
        let repo = self.session.repo();
        if !repo.files.is_empty() {
            prompt.push_str("\n\nRepository overview:\n");
            prompt.push_str(&repo.digest(60));
        }
        let inspected = self.session.inspected_summary(3);
        if !inspected.is_empty() {
            prompt.push_str("\nAlready read this run (do not re-read without reason):\n");
            for (path, count) in inspected {
                prompt.push_str(&format!("  {path} ({count} reads)\n"));
            }
        }
        prompt
    }

    fn task_prompt(&self, profile: &AgentProfile, task: &Task) -> String {
        let mut prompt = format!("Task ({}): {}\n", task.action_type, task.description);
        if !task.target_paths.is_empty() {
            prompt.push_str(&format!(
                "Expected files: {}\n",
                task.target_paths.join(", ")
            ));
        }
        for hint in &task.hints {
            prompt.push_str(&format!("Recovery hint from a previous attempt: {hint}\n"));
        }
        prompt.push_str(&format!(
            "Finish by replying with the phrase \"{}\".",
            profile.sentinel
        ));
        prompt
    }
}
