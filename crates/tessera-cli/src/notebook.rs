//! Notebook files: Rust source split into cells at `// %%` marker lines.

use std::path::Path;

use anyhow::Context;
use tessera_core::CellId;

pub const CELL_MARKER: &str = "// %%";

/// One cell as it appears in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotebookCell {
    pub id: CellId,
    pub source: String,
    /// Line of the cell's first source line.
    pub line: usize,
}

pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Vec<NotebookCell>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("notebook not found: {}", path.display()))?;
    Ok(split_cells(&text))
}

/// Split notebook text into cells. Cells are numbered from 1 in file order;
/// blank stretches between markers are not cells.
pub fn split_cells(text: &str) -> Vec<NotebookCell> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut start = 1;

    for (idx, line) in text.lines().enumerate() {
        if line.trim_start().starts_with(CELL_MARKER) {
            finish_cell(&mut cells, &mut current, start);
            start = idx + 2;
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    finish_cell(&mut cells, &mut current, start);

    cells
}

fn finish_cell(cells: &mut Vec<NotebookCell>, current: &mut String, line: usize) {
    let source = std::mem::take(current);
    if source.trim().is_empty() {
        return;
    }
    cells.push(NotebookCell {
        id: CellId::new(cells.len() + 1),
        source,
        line,
    });
}
