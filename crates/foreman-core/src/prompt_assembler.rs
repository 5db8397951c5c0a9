//! Builds an agent's input text from card + project context under a size
//! budget. Pure function: no I/O, no fallible external calls — the caller is
//! responsible for substituting empty defaults for any context it could not
//! fetch (queries are tolerated to fail by substituting empty defaults).

/// Hard cap on the assembled prompt's total length.
pub const MAX_PROMPT_CHARS: usize = 24_000;
/// Per-section cap applied before the total budget is enforced.
pub const MAX_DOC_CHARS: usize = 4_000;

/// Everything the assembler needs, already fetched by the caller.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub project_name: String,
    pub project_documents: Vec<ProjectDocument>,
    pub recent_decisions: Vec<String>,
    pub sibling_cards: Vec<String>,
    pub card_title: String,
    pub card_description: String,
    pub card_context_snapshot: Option<String>,
    pub active_steering_corrections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectDocument {
    pub kind: DocumentKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Brief,
    Instructions,
    Assumptions,
}

/// Named sections in the documented drop priority (first dropped first).
/// `identity`, `card`, and `checklist` are never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Decisions,
    SiblingAwareness,
    ProjectDocuments,
}

#[derive(Debug, Clone)]
pub struct PromptAssembly {
    pub text: String,
    pub dropped_sections: Vec<Section>,
}

const WORKFLOW_PROTOCOL: &str = "\
Work only within the provided worktree. Make the smallest change that \
satisfies the card. Run the project's own checks before finishing.";

const COMPLETION_CHECKLIST: &str = "\
Before finishing: confirm the change builds, lints, and tests pass; leave \
no partial edits; describe what changed in one paragraph.";

/// Assemble the prompt text, dropping sections in priority order
/// (decisions, then sibling awareness, then project documents) until the
/// total fits `MAX_PROMPT_CHARS`. Identity, card, and checklist sections are
/// never dropped.
pub fn assemble(ctx: &PromptContext) -> PromptAssembly {
    let identity = format!("# Project: {}\n", ctx.project_name);

    let mut card_section = format!(
        "# Card\nTitle: {}\nDescription: {}\n",
        ctx.card_title, ctx.card_description
    );
    if let Some(snapshot) = &ctx.card_context_snapshot {
        card_section.push_str(&format!("Prior context:\n{}\n", truncate(snapshot, MAX_DOC_CHARS)));
    }

    let decisions_section = if ctx.recent_decisions.is_empty() {
        None
    } else {
        Some(format!(
            "# Recent architecture decisions\n{}\n",
            ctx.recent_decisions.join("\n")
        ))
    };

    let siblings_section = if ctx.sibling_cards.is_empty() {
        None
    } else {
        Some(format!(
            "# Other cards in flight\n{}\n",
            ctx.sibling_cards.join("\n")
        ))
    };

    let docs_section = if ctx.project_documents.is_empty() {
        None
    } else {
        let body: String = ctx
            .project_documents
            .iter()
            .map(|d| format!("## {:?}\n{}\n", d.kind, truncate(&d.text, MAX_DOC_CHARS)))
            .collect();
        Some(format!("# Project documents\n{body}"))
    };

    let steering_section = if ctx.active_steering_corrections.is_empty() {
        String::new()
    } else {
        format!(
            "# Active steering corrections\n{}\n",
            ctx.active_steering_corrections.join("\n")
        )
    };

    let mut optional = vec![
        (Section::Decisions, decisions_section),
        (Section::SiblingAwareness, siblings_section),
        (Section::ProjectDocuments, docs_section),
    ];

    let mut dropped = Vec::new();
    loop {
        let text = render(
            &identity,
            &card_section,
            &steering_section,
            &optional,
        );
        if text.chars().count() <= MAX_PROMPT_CHARS {
            return PromptAssembly { text, dropped_sections: dropped };
        }
        match optional.iter_mut().find(|(_, body)| body.is_some()) {
            Some((section, body)) => {
                dropped.push(*section);
                *body = None;
            }
            None => {
                // Even the mandatory sections overflow; truncate as a last resort.
                let truncated: String = text.chars().take(MAX_PROMPT_CHARS).collect();
                return PromptAssembly { text: truncated, dropped_sections: dropped };
            }
        }
    }
}

fn render(
    identity: &str,
    card_section: &str,
    steering_section: &str,
    optional: &[(Section, Option<String>)],
) -> String {
    let mut out = String::new();
    out.push_str(identity);
    out.push_str(card_section);
    out.push_str(steering_section);
    for (_, body) in optional {
        if let Some(body) = body {
            out.push_str(body);
        }
    }
    out.push_str("# Workflow\n");
    out.push_str(WORKFLOW_PROTOCOL);
    out.push('\n');
    out.push_str("# Completion checklist\n");
    out.push_str(COMPLETION_CHECKLIST);
    out.push('\n');
    out
}

fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}
