//! Control-flow serializer
//!
//! Targets with a single control processor cannot run one host loop per
//! region cell. The host program's parallel loops are folded into one
//! sequential two-deep control nest, with sequential child loops merged
//! into matching loops already present in that nest.
//!
//! Only the first launch, or first child loop, of each loop is followed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{CompileError, CompileResult};

/// Affine index expression over loop variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexExpr {
    Const(i64),
    Var(String),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
}

impl IndexExpr {
    pub fn var(name: impl Into<String>) -> Self {
        IndexExpr::Var(name.into())
    }

    fn remap(&self, map: &HashMap<String, String>) -> Self {
        match self {
            IndexExpr::Const(v) => IndexExpr::Const(*v),
            IndexExpr::Var(name) => IndexExpr::Var(map.get(name).cloned().unwrap_or_else(|| name.clone())),
            IndexExpr::Add(a, b) => IndexExpr::Add(Box::new(a.remap(map)), Box::new(b.remap(map))),
            IndexExpr::Mul(a, b) => IndexExpr::Mul(Box::new(a.remap(map)), Box::new(b.remap(map))),
        }
    }

    /// Value when free of variables
    pub fn as_const(&self) -> Option<i64> {
        match self {
            IndexExpr::Const(v) => Some(*v),
            IndexExpr::Var(_) => None,
            IndexExpr::Add(a, b) => Some(a.as_const()? + b.as_const()?),
            IndexExpr::Mul(a, b) => Some(a.as_const()? * b.as_const()?),
        }
    }
}

impl std::fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexExpr::Const(v) => write!(f, "{}", v),
            IndexExpr::Var(name) => write!(f, "%{}", name),
            IndexExpr::Add(a, b) => write!(f, "({} + {})", a, b),
            IndexExpr::Mul(a, b) => write!(f, "({} * {})", a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Parallel,
    Sequential,
}

/// A host loop over one or more induction variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLoop {
    pub kind: LoopKind,
    pub ivs: Vec<String>,
    pub lower: Vec<IndexExpr>,
    pub upper: Vec<IndexExpr>,
    pub step: Vec<IndexExpr>,
    #[serde(default)]
    pub body: Vec<HostStmt>,
}

impl HostLoop {
    pub fn sequential(iv: impl Into<String>, lower: i64, upper: i64, step: i64, body: Vec<HostStmt>) -> Self {
        Self {
            kind: LoopKind::Sequential,
            ivs: vec![iv.into()],
            lower: vec![IndexExpr::Const(lower)],
            upper: vec![IndexExpr::Const(upper)],
            step: vec![IndexExpr::Const(step)],
            body,
        }
    }

    pub fn parallel(ivs: &[&str], upper: &[i64], body: Vec<HostStmt>) -> Self {
        Self {
            kind: LoopKind::Parallel,
            ivs: ivs.iter().map(|s| s.to_string()).collect(),
            lower: ivs.iter().map(|_| IndexExpr::Const(0)).collect(),
            upper: upper.iter().map(|u| IndexExpr::Const(*u)).collect(),
            step: ivs.iter().map(|_| IndexExpr::Const(1)).collect(),
            body,
        }
    }

    fn contains_launch(&self) -> bool {
        self.body.iter().any(|s| match s {
            HostStmt::Launch(_) => true,
            HostStmt::Loop(inner) => inner.contains_launch(),
        })
    }
}

/// Host-side launch of a movement op
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLaunch {
    pub op_id: u32,
    #[serde(default)]
    pub operands: Vec<IndexExpr>,
}

impl HostLaunch {
    pub fn new(op_id: u32, operands: Vec<IndexExpr>) -> Self {
        Self { op_id, operands }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStmt {
    Loop(HostLoop),
    Launch(HostLaunch),
}

impl HostStmt {
    fn remap(&self, map: &HashMap<String, String>) -> Self {
        match self {
            HostStmt::Launch(launch) => HostStmt::Launch(HostLaunch {
                op_id: launch.op_id,
                operands: launch.operands.iter().map(|e| e.remap(map)).collect(),
            }),
            HostStmt::Loop(l) => HostStmt::Loop(HostLoop {
                kind: l.kind,
                ivs: l.ivs.iter().map(|iv| map.get(iv).cloned().unwrap_or_else(|| iv.clone())).collect(),
                lower: l.lower.iter().map(|e| e.remap(map)).collect(),
                upper: l.upper.iter().map(|e| e.remap(map)).collect(),
                step: l.step.iter().map(|e| e.remap(map)).collect(),
                body: l.body.iter().map(|s| s.remap(map)).collect(),
            }),
        }
    }
}

/// Host program of one device scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFunction {
    pub name: String,
    #[serde(default)]
    pub body: Vec<HostStmt>,
}

/// Serialized control program: statements kept from the top level, then a
/// two-deep nest walking the region's cells
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlProgram {
    pub prologue: Vec<HostStmt>,
    pub outer_iv: String,
    pub inner_iv: String,
    pub outer_extent: u32,
    pub inner_extent: u32,
    pub body: Vec<HostStmt>,
}

#[derive(Debug, Clone, Copy)]
enum InsertAt {
    Start,
    End,
}

fn body_at<'a>(mut body: &'a mut Vec<HostStmt>, path: &[usize]) -> Option<&'a mut Vec<HostStmt>> {
    for &i in path {
        match body.get_mut(i) {
            Some(HostStmt::Loop(l)) => body = &mut l.body,
            _ => return None,
        }
    }
    Some(body)
}

fn first_loop(body: &[HostStmt]) -> Option<usize> {
    body.iter()
        .position(|s| matches!(s, HostStmt::Loop(l) if l.kind == LoopKind::Sequential))
}

fn launch_count(body: &[HostStmt]) -> usize {
    body.iter().filter(|s| matches!(s, HostStmt::Launch(_))).count()
}

fn loop_count(body: &[HostStmt]) -> usize {
    body.iter()
        .filter(|s| matches!(s, HostStmt::Loop(l) if l.kind == LoopKind::Sequential))
        .count()
}

pub struct ControlFlowSerializer {
    program: ControlProgram,
    fresh: usize,
}

impl ControlFlowSerializer {
    pub fn new(outer_extent: u32, inner_extent: u32) -> Self {
        Self {
            program: ControlProgram {
                prologue: Vec::new(),
                outer_iv: "ctrl_x".into(),
                inner_iv: "ctrl_y".into(),
                outer_extent,
                inner_extent,
                body: Vec::new(),
            },
            fresh: 0,
        }
    }

    /// Fold `host`. Returns `None` when it has no parallel loop launching
    /// movement ops.
    pub fn serialize(mut self, host: &HostFunction) -> CompileResult<Option<ControlProgram>> {
        let has_candidate = host
            .body
            .iter()
            .any(|s| matches!(s, HostStmt::Loop(l) if l.kind == LoopKind::Parallel && l.contains_launch()));
        if !has_candidate {
            return Ok(None);
        }

        for stmt in &host.body {
            match stmt {
                HostStmt::Loop(l) if l.kind == LoopKind::Parallel => {
                    if l.contains_launch() {
                        self.fold_parallel(l)?;
                    }
                }
                HostStmt::Loop(l) => {
                    if l.contains_launch() {
                        return Err(CompileError::incomplete_fold(format!(
                            "top-level sequential loop over %{} launches movement ops",
                            l.ivs.join(", %")
                        )));
                    }
                    debug!(ivs = ?l.ivs, "dropped loop without launches");
                }
                HostStmt::Launch(_) => self.program.prologue.push(stmt.clone()),
            }
        }
        Ok(Some(self.program))
    }

    fn fresh_iv(&mut self) -> String {
        self.fresh += 1;
        format!("ctrl_iv{}", self.fresh)
    }

    fn fold_parallel(&mut self, par: &HostLoop) -> CompileResult<()> {
        if par.ivs.len() != 2 {
            return Err(CompileError::incomplete_fold(format!(
                "parallel loop has {} induction variables, control nest has 2",
                par.ivs.len()
            )));
        }
        let mut map = HashMap::new();
        map.insert(par.ivs[0].clone(), self.program.outer_iv.clone());
        map.insert(par.ivs[1].clone(), self.program.inner_iv.clone());

        let launches = launch_count(&par.body);
        let loops = loop_count(&par.body);
        if launches > 0 {
            if launches > 1 || loops > 0 {
                return Err(CompileError::incomplete_fold(
                    "parallel loop mixes several launches or loops; only the first would fold",
                ));
            }
            let remapped: Vec<HostStmt> = par.body.iter().map(|s| s.remap(&map)).collect();
            self.program.body.extend(remapped);
            return Ok(());
        }

        let mut src = first_loop(&par.body).and_then(|i| match &par.body[i] {
            HostStmt::Loop(l) => Some(l),
            HostStmt::Launch(_) => None,
        });
        if loops > 1 {
            return Err(CompileError::incomplete_fold(
                "parallel loop holds more than one child loop; only the first would fold",
            ));
        }

        let mut path: Vec<usize> = Vec::new();
        let mut insert_at = InsertAt::End;
        let mut ctrl_child = first_loop(&self.program.body);

        while let Some(this) = src {
            if let Some(index) = ctrl_child {
                path.push(index);
                insert_at = InsertAt::Start;
                let ctrl_iv = match body_at(&mut self.program.body, &path[..path.len() - 1])
                    .and_then(|b| b.get(index))
                {
                    Some(HostStmt::Loop(l)) => l.ivs.clone(),
                    _ => return Err(CompileError::codegen("control nest lost a loop")),
                };
                for (from, to) in this.ivs.iter().zip(ctrl_iv) {
                    map.insert(from.clone(), to);
                }
                if launch_count(&this.body) > 0 {
                    let remapped: Vec<HostStmt> = this.body.iter().map(|s| s.remap(&map)).collect();
                    let target = body_at(&mut self.program.body, &path)
                        .ok_or_else(|| CompileError::codegen("control nest lost a loop"))?;
                    target.extend(remapped);
                    return Ok(());
                }
                if loop_count(&this.body) > 1 {
                    return Err(CompileError::incomplete_fold(
                        "loop holds more than one child loop; only the first would fold",
                    ));
                }
                let next_body = body_at(&mut self.program.body, &path)
                    .ok_or_else(|| CompileError::codegen("control nest lost a loop"))?;
                ctrl_child = first_loop(next_body);
            } else {
                let mut local = map.clone();
                let ivs: Vec<String> = this.ivs.iter().map(|_| self.fresh_iv()).collect();
                for (from, to) in this.ivs.iter().zip(&ivs) {
                    local.insert(from.clone(), to.clone());
                }
                let cloned = HostLoop {
                    kind: LoopKind::Sequential,
                    ivs,
                    lower: this.lower.iter().map(|e| e.remap(&map)).collect(),
                    upper: this.upper.iter().map(|e| e.remap(&map)).collect(),
                    step: this.step.iter().map(|e| e.remap(&map)).collect(),
                    body: this.body.iter().map(|s| s.remap(&local)).collect(),
                };
                let target = body_at(&mut self.program.body, &path)
                    .ok_or_else(|| CompileError::codegen("control nest lost a loop"))?;
                match insert_at {
                    InsertAt::Start => target.insert(0, HostStmt::Loop(cloned)),
                    InsertAt::End => target.push(HostStmt::Loop(cloned)),
                }
                return Ok(());
            }
            src = first_loop(&this.body).and_then(|i| match &this.body[i] {
                HostStmt::Loop(l) => Some(l),
                HostStmt::Launch(_) => None,
            });
        }
        Err(CompileError::incomplete_fold(
            "movement launch not reachable through first child loops",
        ))
    }
}
