//! Column layout for conversation trees.
//!
//! Nodes are placed in depth-first order. The first child of a node stays in
//! the parent's column directly below it; every later sibling opens a column
//! to the right of all columns still occupied at the first child's top, so
//! siblings line up horizontally at the fork. Heights come from the content
//! (estimated or measured) and a column is never reused until its last
//! occupant has cleared vertically.

use std::collections::{HashMap, HashSet};

use dialog_core::{DialogNode, DialogTree, Role};
use serde::Serialize;
use uuid::Uuid;

use crate::describe;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOptions {
    pub node_width: f64,
    pub column_gap: f64,
    pub vertical_gap: f64,
    pub line_height: f64,
    pub chars_per_line: usize,
    pub padding: f64,
    pub min_node_height: f64,
    pub max_node_height: f64,
    /// Also place the root sentinel as a node.
    pub include_root: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            node_width: 240.0,
            column_gap: 40.0,
            vertical_gap: 24.0,
            line_height: 18.0,
            chars_per_line: 32,
            padding: 12.0,
            min_node_height: 40.0,
            max_node_height: 320.0,
            include_root: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionedNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub column: usize,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub depth: usize,
    pub sibling_index: usize,
    pub role: Role,
    pub is_fork: bool,
    pub on_main_branch: bool,
    pub on_active_path: bool,
    pub label: String,
}

impl PositionedNode {
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn top_center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y)
    }

    pub fn bottom_center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.bottom())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Parent to first child: a straight segment down the column.
    Straight,
    /// Parent to a later sibling: a smooth curve into the fork column.
    Curve,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connector {
    pub from: Uuid,
    pub to: Uuid,
    pub kind: ConnectorKind,
    pub start: Point,
    pub end: Point,
    /// Cubic bezier control points, present for curves.
    pub controls: Option<(Point, Point)>,
}

impl Connector {
    fn between(parent: &PositionedNode, child: &PositionedNode) -> Self {
        let start = parent.bottom_center();
        let end = child.top_center();
        let (kind, controls) = if child.sibling_index == 0 {
            (ConnectorKind::Straight, None)
        } else {
            let mid_y = start.y + (end.y - start.y) / 2.0;
            (
                ConnectorKind::Curve,
                Some((Point::new(start.x, mid_y), Point::new(end.x, mid_y))),
            )
        };
        Self {
            from: parent.id,
            to: child.id,
            kind,
            start,
            end,
            controls,
        }
    }

    pub fn svg_path(&self) -> String {
        match self.controls {
            None => format!(
                "M {:.1} {:.1} L {:.1} {:.1}",
                self.start.x, self.start.y, self.end.x, self.end.y
            ),
            Some((c1, c2)) => format!(
                "M {:.1} {:.1} C {:.1} {:.1}, {:.1} {:.1}, {:.1} {:.1}",
                self.start.x, self.start.y, c1.x, c1.y, c2.x, c2.y, self.end.x, self.end.y
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GraphLayout {
    /// Depth-first order, the same order the navigator lists entries in.
    pub nodes: Vec<PositionedNode>,
    pub connectors: Vec<Connector>,
    pub width: f64,
    pub height: f64,
}

impl GraphLayout {
    pub fn node(&self, id: Uuid) -> Option<&PositionedNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn column_count(&self) -> usize {
        self.nodes.iter().map(|n| n.column + 1).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphLayoutEngine {
    options: LayoutOptions,
}

struct Pending {
    id: Uuid,
    /// Parent placed in this layout (absent for top-level nodes).
    parent: Option<Uuid>,
    sibling_index: usize,
}

impl GraphLayoutEngine {
    pub fn new(options: LayoutOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LayoutOptions {
        &self.options
    }

    /// Height from estimated wrapped line count, clamped to the configured bounds.
    pub fn estimate_height(&self, content: &str) -> f64 {
        let per_line = self.options.chars_per_line.max(1);
        let lines: usize = content
            .lines()
            .map(|line| line.chars().count().div_ceil(per_line).max(1))
            .sum::<usize>()
            .max(1);
        let height = self.options.padding * 2.0 + lines as f64 * self.options.line_height;
        height.clamp(self.options.min_node_height, self.options.max_node_height)
    }

    pub fn layout(&self, tree: &DialogTree) -> Result<GraphLayout> {
        self.layout_with(tree, |_| None)
    }

    /// Like [`GraphLayoutEngine::layout`], using `measure` for node heights when it
    /// returns one (e.g. from a renderer that already laid the text out).
    pub fn layout_with<F>(&self, tree: &DialogTree, measure: F) -> Result<GraphLayout>
    where
        F: Fn(&DialogNode) -> Option<f64>,
    {
        let opts = &self.options;
        let main_branch: HashSet<Uuid> = tree.main_branch().into_iter().collect();
        let active_path: HashSet<Uuid> = tree.path_to(tree.active_leaf())?.into_iter().collect();

        let mut placed: Vec<PositionedNode> = Vec::with_capacity(tree.len());
        let mut index_of: HashMap<Uuid, usize> = HashMap::new();
        let mut column_bottoms: Vec<Option<f64>> = Vec::new();
        let mut fork_tops: HashMap<Option<Uuid>, f64> = HashMap::new();

        let mut stack: Vec<Pending> = if opts.include_root {
            vec![Pending {
                id: tree.root_id(),
                parent: None,
                sibling_index: 0,
            }]
        } else {
            tree.root()
                .children()
                .iter()
                .enumerate()
                .rev()
                .map(|(sibling_index, id)| Pending {
                    id: *id,
                    parent: None,
                    sibling_index,
                })
                .collect()
        };
        let mut depth_of: HashMap<Uuid, usize> = HashMap::from([(tree.root_id(), 0)]);

        while let Some(pending) = stack.pop() {
            let node = tree.get(pending.id)?;
            let parent = pending.parent.map(|id| &placed[index_of[&id]]);
            let parent_column = parent.map_or(0, |p| p.column);
            let parent_bottom = parent.map(|p| p.bottom());

            let height = match measure(node) {
                Some(measured) => measured.max(0.0),
                None if node.is_sentinel() => opts.min_node_height,
                None => self.estimate_height(node.content().unwrap_or("")),
            };

            let (column, y) = if pending.sibling_index == 0 {
                let below_parent = parent_bottom.map_or(0.0, |b| b + opts.vertical_gap);
                let column = parent_column;
                let below_column = column_bottoms
                    .get(column)
                    .copied()
                    .flatten()
                    .map_or(0.0, |b| b + opts.vertical_gap);
                (column, below_parent.max(below_column))
            } else {
                let top = fork_tops
                    .get(&pending.parent)
                    .copied()
                    .unwrap_or_else(|| parent_bottom.map_or(0.0, |b| b + opts.vertical_gap));
                let busy = column_bottoms
                    .iter()
                    .enumerate()
                    .filter(|(_, bottom)| bottom.is_some_and(|b| b + opts.vertical_gap > top))
                    .map(|(column, _)| column)
                    .max();
                let column = busy.map_or(parent_column + 1, |c| c + 1).max(parent_column + 1);
                let below_column = column_bottoms
                    .get(column)
                    .copied()
                    .flatten()
                    .map_or(top, |b| b + opts.vertical_gap);
                (column, top.max(below_column))
            };

            if pending.sibling_index == 0 {
                fork_tops.insert(pending.parent, y);
            }
            if column_bottoms.len() <= column {
                column_bottoms.resize(column + 1, None);
            }
            column_bottoms[column] = Some(y + height);

            let depth = node
                .parent_id()
                .and_then(|p| depth_of.get(&p))
                .map_or(0, |d| d + 1);
            depth_of.insert(node.id(), depth);

            let positioned = PositionedNode {
                id: node.id(),
                parent_id: pending.parent,
                column,
                x: column as f64 * (opts.node_width + opts.column_gap),
                y,
                width: opts.node_width,
                height,
                depth,
                sibling_index: pending.sibling_index,
                role: node.role(),
                is_fork: node.is_fork(),
                on_main_branch: main_branch.contains(&node.id()),
                on_active_path: active_path.contains(&node.id()),
                label: describe(node),
            };
            index_of.insert(positioned.id, placed.len());
            placed.push(positioned);

            for (sibling_index, child) in node.children().iter().enumerate().rev() {
                stack.push(Pending {
                    id: *child,
                    parent: Some(node.id()),
                    sibling_index,
                });
            }
        }

        let connectors = placed
            .iter()
            .filter_map(|child| {
                let parent = &placed[*index_of.get(&child.parent_id?)?];
                Some(Connector::between(parent, child))
            })
            .collect();

        let columns = placed.iter().map(|n| n.column + 1).max().unwrap_or(0);
        let width = if columns == 0 {
            0.0
        } else {
            columns as f64 * (opts.node_width + opts.column_gap) - opts.column_gap
        };
        let height = placed.iter().map(PositionedNode::bottom).fold(0.0, f64::max);

        tracing::debug!(
            nodes = placed.len(),
            columns,
            width,
            height,
            "GraphLayoutEngine: layout complete"
        );

        Ok(GraphLayout {
            nodes: placed,
            connectors,
            width,
            height,
        })
    }
}
