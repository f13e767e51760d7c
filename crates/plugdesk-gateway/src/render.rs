// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Page shell rendering for plugin HTML fragments.
//!
//! The host application normally supplies its own template-backed
//! [`PageRenderer`]; [`ShellRenderer`] is a dependency-free default.

use crate::auth::Principal;

/// Everything a page shell needs to wrap a fragment.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub title: &'a str,
    /// Trusted HTML produced by a plugin.
    pub body_html: &'a str,
    pub active_page: &'a str,
    pub user: Option<&'a Principal>,
}

/// Wraps plugin HTML in the host's page layout.
pub trait PageRenderer: Send + Sync + 'static {
    fn render_page(&self, page: &PageContext<'_>) -> String;
}

/// Minimal standalone HTML layout.
#[derive(Debug, Clone)]
pub struct ShellRenderer {
    site_name: String,
}

impl ShellRenderer {
    pub fn new(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
        }
    }
}

impl Default for ShellRenderer {
    fn default() -> Self {
        Self::new("Plugdesk")
    }
}

impl PageRenderer for ShellRenderer {
    fn render_page(&self, page: &PageContext<'_>) -> String {
        let title = if page.title.is_empty() {
            escape_html(&self.site_name)
        } else {
            format!("{} - {}", escape_html(page.title), escape_html(&self.site_name))
        };
        let user = page
            .user
            .map(|u| format!(r#"<span class="gk-user">{}</span>"#, escape_html(&u.user_id)))
            .unwrap_or_default();
        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
             <body data-active-page=\"{active}\">\n<header>{user}</header>\n<main>{body}</main>\n</body>\n</html>\n",
            active = escape_html(page.active_page),
            body = page.body_html,
        )
    }
}

/// Card markup used by `?wrap=true` widget requests.
pub fn widget_card(title: &str, html: &str) -> String {
    format!(
        r#"<div class="gk-card-header"><h3 class="gk-card-title">{}</h3></div><div class="gk-card-body">{html}</div>"#,
        escape_html(title)
    )
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escapes_title_but_not_body() {
        let html = ShellRenderer::default().render_page(&PageContext {
            title: "<Reports>",
            body_html: "<p>ok</p>",
            active_page: "plugin",
            user: None,
        });
        assert!(html.contains("&lt;Reports&gt; - Plugdesk"));
        assert!(html.contains("<main><p>ok</p></main>"));
    }

    #[test]
    fn card_wraps_widget() {
        let card = widget_card("Sales", "<b>42</b>");
        assert!(card.starts_with(r#"<div class="gk-card-header">"#));
        assert!(card.contains("<b>42</b>"));
    }
}
