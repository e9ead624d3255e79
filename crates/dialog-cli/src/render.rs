use std::collections::HashSet;
use std::fmt::Write;

use colored::Colorize;
use dialog_core::{DialogContext, DialogTree, NodeKind, Role};
use dialog_graph::{ConnectorKind, GraphLayout};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 60;

pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn preview(content: &str) -> String {
    let line = content.trim().lines().next().unwrap_or("");
    if line.chars().count() > PREVIEW_CHARS {
        format!("{}...", line.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        line.to_string()
    }
}

fn role_tag(role: Role) -> colored::ColoredString {
    match role {
        Role::System => "system".magenta(),
        Role::User => "user".cyan(),
        Role::Assistant => "assistant".green(),
        Role::Sentinel => "root".dimmed(),
    }
}

/// Indented tree; `*` marks the active path, alternatives are listed under their turn.
pub fn tree_outline(tree: &DialogTree) -> String {
    let active: HashSet<Uuid> = tree
        .path_to(tree.active_leaf())
        .map(|path| path.into_iter().collect())
        .unwrap_or_default();

    let mut out = String::new();
    for (id, depth) in tree.depth_first_from(tree.root_id()) {
        let Some(node) = tree.node(id) else {
            continue;
        };
        let indent = "  ".repeat(depth);
        let marker = if active.contains(&id) { "*" } else { " " };
        let mut line = format!(
            "{indent}{marker} {} {}",
            short_id(id).dimmed(),
            role_tag(node.role())
        );
        if node.is_fork() {
            let _ = write!(line, " {}", format!("[fork x{}]", node.children().len()).yellow());
        }
        if id == tree.active_leaf() {
            let _ = write!(line, " {}", "<- active".bold());
        }

        match node.kind() {
            NodeKind::Sentinel => {}
            NodeKind::System(turn) | NodeKind::User(turn) | NodeKind::Assistant(turn) => {
                let _ = write!(line, " {}", preview(&turn.content));
            }
            NodeKind::Responses(set) => {
                let accepted = set.accepted_index();
                for (index, item) in set.items().iter().enumerate() {
                    let mark = if accepted == Some(index) { "+" } else { "-" };
                    let status = if item.responding {
                        " (responding)".yellow().to_string()
                    } else if let Some(error) = &item.error_message {
                        format!(" (failed: {error})").red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = write!(
                        line,
                        "\n{indent}    {mark} [{index}] {} {}{status}",
                        item.backend.dimmed(),
                        preview(&item.content)
                    );
                }
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

pub fn context_listing(context: &DialogContext) -> String {
    let mut out = String::new();
    if let Some(prompt) = &context.system_prompt {
        let _ = writeln!(out, "{}: {}", "system".magenta().bold(), prompt);
    }
    for message in &context.history {
        let _ = writeln!(
            out,
            "{} {}: {}",
            short_id(message.node_id).dimmed(),
            role_tag(message.role),
            message.content
        );
    }
    let _ = writeln!(
        out,
        "{}",
        format!(
            "{} message(s), ~{} tokens",
            context.history.len(),
            context.total_tokens()
        )
        .dimmed()
    );
    out
}

pub fn layout_table(layout: &GraphLayout) -> String {
    let mut out = String::new();
    for node in &layout.nodes {
        let _ = writeln!(
            out,
            "{} col {:>2}  x {:>7.1}  y {:>7.1}  h {:>6.1}{}{}  {}",
            short_id(node.id),
            node.column,
            node.x,
            node.y,
            node.height,
            if node.on_main_branch { "  main" } else { "      " },
            if node.on_active_path { "  active" } else { "        " },
            node.label
        );
    }
    let _ = writeln!(
        out,
        "{} node(s), {} connector(s), {:.0} x {:.0}",
        layout.nodes.len(),
        layout.connectors.len(),
        layout.width,
        layout.height
    );
    out
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn layout_svg(layout: &GraphLayout) -> String {
    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{:.0}" height="{:.0}">"#,
        layout.width, layout.height
    );
    for connector in &layout.connectors {
        let dash = match connector.kind {
            ConnectorKind::Straight => "",
            ConnectorKind::Curve => r#" stroke-dasharray="4 2""#,
        };
        let _ = writeln!(
            svg,
            r#"  <path d="{}" fill="none" stroke="gray"{dash}/>"#,
            connector.svg_path()
        );
    }
    for node in &layout.nodes {
        let stroke = if node.on_active_path { "black" } else { "silver" };
        let _ = writeln!(
            svg,
            r#"  <rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" rx="6" fill="white" stroke="{stroke}"/>"#,
            node.x, node.y, node.width, node.height
        );
        let _ = writeln!(
            svg,
            r#"  <text x="{:.1}" y="{:.1}" font-size="12">{}</text>"#,
            node.x + 8.0,
            node.y + 18.0,
            escape_xml(&node.label)
        );
    }
    svg.push_str("</svg>\n");
    svg
}
