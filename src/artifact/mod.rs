//! Artifact-to-rows conversion.
//!
//! The dashboard's export is an HTML document wrapping a single data table.
//! We pull the first table's rows out with a plain scanner; anything that is
//! not markup is rejected so the sink never receives garbage.

use std::path::Path;

use anyhow::{Context, Result};

/// Read a downloaded artifact and extract its tabular rows.
pub fn rows_from_artifact(path: &Path) -> Result<Vec<Vec<String>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;

    let head = content.trim_start().to_ascii_lowercase();
    if !(head.starts_with("<html") || head.starts_with("<!doctype")) {
        anyhow::bail!(
            "artifact {} is not a markup export; cannot extract rows",
            path.display()
        );
    }

    let rows = extract_table_rows(&content);
    if rows.is_empty() {
        anyhow::bail!("artifact {} contains no table rows", path.display());
    }
    Ok(rows)
}

/// Scan `<tr>`/`<td>`/`<th>` structure out of the document. First table only.
pub(crate) fn extract_table_rows(html: &str) -> Vec<Vec<String>> {
    let lower = html.to_ascii_lowercase();

    let Some(table_start) = lower.find("<table") else {
        return Vec::new();
    };
    let table_end = lower[table_start..]
        .find("</table")
        .map(|i| table_start + i)
        .unwrap_or(lower.len());

    let mut rows = Vec::new();
    let mut pos = table_start;
    while let Some(tr_rel) = lower[pos..table_end].find("<tr") {
        let tr_start = pos + tr_rel;
        let Some(tr_open_end) = lower[tr_start..table_end].find('>') else {
            break;
        };
        let row_body_start = tr_start + tr_open_end + 1;
        let row_end = lower[row_body_start..table_end]
            .find("</tr")
            .map(|i| row_body_start + i)
            .unwrap_or(table_end);

        let cells = extract_cells(&html[row_body_start..row_end], &lower[row_body_start..row_end]);
        if !cells.is_empty() {
            rows.push(cells);
        }
        pos = row_end + 1;
    }
    rows
}

fn extract_cells(row: &str, row_lower: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut pos = 0;
    loop {
        let td = row_lower[pos..].find("<td").map(|i| pos + i);
        let th = row_lower[pos..].find("<th").map(|i| pos + i);
        let cell_start = match (td, th) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => break,
        };
        let Some(open_end) = row_lower[cell_start..].find('>') else {
            break;
        };
        let body_start = cell_start + open_end + 1;
        let body_end = row_lower[body_start..]
            .find("</t")
            .map(|i| body_start + i)
            .unwrap_or(row.len());

        cells.push(clean_cell(&row[body_start..body_end]));
        pos = body_end + 1;
        if pos >= row.len() {
            break;
        }
    }
    cells
}

/// Strip nested tags, collapse whitespace, decode the common entities.
fn clean_cell(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
