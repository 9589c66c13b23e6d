//! Árbol fijo de categorías de solución y selección jerárquica.
//!
//! El árbol no es configurable en tiempo de ejecución: los nodos intermedios
//! sólo se expanden o contraen, y únicamente las hojas cierran una selección.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::payload::UNKNOWN;

/// Separador usado para mostrar una ruta completa en la UI.
pub const DISPLAY_SEPARATOR: &str = " > ";
/// Separador de la forma abreviada que se guarda en el campo `Action`.
pub const ACTION_SEPARATOR: &str = " - ";

/// Etiqueta de la hoja de texto libre.
pub const OTHER_LABEL: &str = "Other";

#[derive(Debug, Clone, Serialize)]
pub struct SolutionNode {
    pub label: &'static str,
    /// Hoja cuyo valor lo escribe el usuario.
    pub free_text: bool,
    pub children: Vec<SolutionNode>,
}

impl SolutionNode {
    fn leaf(label: &'static str) -> Self {
        Self {
            label,
            free_text: false,
            children: Vec::new(),
        }
    }

    fn branch(label: &'static str, children: Vec<SolutionNode>) -> Self {
        Self {
            label,
            free_text: false,
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SolutionTree {
    pub roots: Vec<SolutionNode>,
}

impl SolutionTree {
    /// Recorre el árbol siguiendo las etiquetas (sin distinguir mayúsculas) y
    /// devuelve la ruta con la grafía del árbol junto al nodo final.
    pub fn canonical_path<S: AsRef<str>>(&self, path: &[S]) -> Option<(Vec<String>, &SolutionNode)> {
        let (first, rest) = path.split_first()?;
        let mut node = find_child(&self.roots, first.as_ref())?;
        let mut labels = vec![node.label.to_string()];
        for label in rest {
            node = find_child(&node.children, label.as_ref())?;
            labels.push(node.label.to_string());
        }
        Some((labels, node))
    }
}

/// Ruta con las etiquetas del árbol si existe; si no, los segmentos recortados.
pub fn canonicalize<S: AsRef<str>>(path: &[S]) -> Vec<String> {
    match solution_tree().canonical_path(path) {
        Some((labels, _)) => labels,
        None => path.iter().map(|s| s.as_ref().trim().to_string()).collect(),
    }
}

fn find_child<'a>(nodes: &'a [SolutionNode], label: &str) -> Option<&'a SolutionNode> {
    nodes
        .iter()
        .find(|node| node.label.eq_ignore_ascii_case(label.trim()))
}

static SOLUTION_TREE: Lazy<SolutionTree> = Lazy::new(|| SolutionTree {
    roots: vec![
        SolutionNode::branch(
            "Open GDCO",
            vec![
                SolutionNode::branch(
                    "Action",
                    vec![
                        SolutionNode::leaf("Reseat"),
                        SolutionNode::leaf("Replace"),
                        SolutionNode::leaf("Swap"),
                        SolutionNode::leaf("Reimage"),
                        SolutionNode::leaf("Power Cycle"),
                        SolutionNode::leaf("Firmware Update"),
                    ],
                ),
                SolutionNode::branch(
                    "Investigate",
                    vec![
                        SolutionNode::leaf("Cable Check"),
                        SolutionNode::leaf("Visual Inspection"),
                        SolutionNode::leaf("Run Diagnostics"),
                    ],
                ),
            ],
        ),
        SolutionNode::leaf("Return to Production"),
        SolutionNode::leaf("Keep on Probation"),
        SolutionNode {
            label: OTHER_LABEL,
            free_text: true,
            children: Vec::new(),
        },
    ],
});

pub fn solution_tree() -> &'static SolutionTree {
    &SOLUTION_TREE
}

/// Selección del usuario: una ruta del árbol o el texto libre de "Other".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SolutionSelection {
    Path { path: Vec<String> },
    Other { text: String },
}

impl SolutionSelection {
    pub fn display(&self) -> String {
        match self {
            Self::Path { path } => display_path(path),
            Self::Other { text } => format!("{OTHER_LABEL}{DISPLAY_SEPARATOR}{}", text.trim()),
        }
    }

    /// Valor que termina en el campo `Action` del payload.
    pub fn action(&self) -> String {
        match self {
            Self::Path { path } => selection_action(path),
            Self::Other { text } if text.trim().is_empty() => UNKNOWN.to_string(),
            Self::Other { text } => text.trim().to_string(),
        }
    }
}

pub fn display_path<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(|segment| segment.as_ref().trim())
        .collect::<Vec<_>>()
        .join(DISPLAY_SEPARATOR)
}

/// Forma abreviada "A - B" con los dos últimos segmentos de la ruta.
pub fn selection_action<S: AsRef<str>>(path: &[S]) -> String {
    let segments: Vec<&str> = path
        .iter()
        .map(|segment| segment.as_ref().trim())
        .filter(|segment| !segment.is_empty())
        .collect();

    match segments.as_slice() {
        [] => UNKNOWN.to_string(),
        [single] => single.to_string(),
        [.., parent, leaf] => format!("{parent}{ACTION_SEPARATOR}{leaf}"),
    }
}
