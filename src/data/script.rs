//! Optional per-row script from the profile
//!
//! The script sees the row as a mutable map `row` (header name -> string) and
//! can reject the row by assigning a reason to `skip`:
//!
//! ```rhai
//! if row.Finish == "Raw" { skip = "raw finish is not sold"; }
//! row.Brand = row.Brand.to_upper();
//! ```

use crate::data::row::FeedRow;
use rhai::packages::{BasicArrayPackage, CorePackage, LogicPackage, MoreStringPackage, Package};
use rhai::{Dynamic, Engine, ImmutableString, OptimizationLevel, Position, Scope, AST};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("row_script compilation failed: {0}")]
    Compile(String),
    #[error("row_script failed: {0}")]
    Runtime(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ScriptOutcome {
    Keep(FeedRow),
    Skip(String),
}

#[derive(Debug)]
pub struct RowScript {
    engine: Engine,
    ast: AST,
}

impl RowScript {
    /// `None` for an empty script
    pub fn compile(source: &str) -> Result<Option<Self>, ScriptError> {
        if source.trim().is_empty() {
            return Ok(None);
        }

        let engine = get_base_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        Ok(Some(Self { engine, ast }))
    }

    pub fn run(&self, row: FeedRow) -> Result<ScriptOutcome, ScriptError> {
        let mut script_row = rhai::Map::new();
        for (name, value) in row.to_map() {
            script_row.insert(name.into(), value.into());
        }

        let mut scope = Scope::new();
        scope.push("row", script_row);
        scope.push("skip", ());

        self.engine
            .run_ast_with_scope(&mut scope, &self.ast)
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        if let Some(reason) = scope.get_value::<ImmutableString>("skip") {
            let reason = reason.trim();
            if !reason.is_empty() {
                return Ok(ScriptOutcome::Skip(reason.to_owned()));
            }
        }

        let row_result: rhai::Map = scope
            .get_value("row")
            .ok_or_else(|| ScriptError::Runtime("`row` is no longer a map".to_string()))?;
        let mut row_after_script = FeedRow::default();
        for (name, value) in row_result {
            if value.is_unit() {
                continue;
            }
            row_after_script.insert(name.as_str(), dynamic_to_string(value));
        }

        Ok(ScriptOutcome::Keep(row_after_script))
    }
}

fn dynamic_to_string(value: Dynamic) -> String {
    match value.clone().into_string() {
        Ok(s) => s,
        Err(_) => value.to_string(),
    }
}

fn get_base_engine() -> Engine {
    let mut engine = Engine::new_raw();
    engine.set_optimization_level(OptimizationLevel::Full);
    // a row script is small, anything running this long is stuck in a loop
    engine.set_max_operations(100_000);

    engine.on_print(|text| info!(target: "row_script", "{text}"));
    engine.on_debug(|text, source, pos| match (source, pos) {
        (Some(source), Position::NONE) => debug!(target: "row_script", "{source} | {text}"),
        (Some(source), pos) => debug!(target: "row_script", "{source} @ {pos:?} | {text}"),
        (None, Position::NONE) => debug!(target: "row_script", "{text}"),
        (None, pos) => debug!(target: "row_script", "{pos:?} | {text}"),
    });

    let core_package = CorePackage::new();
    core_package.register_into_engine(&mut engine);
    let logic_package = LogicPackage::new();
    logic_package.register_into_engine(&mut engine);
    let string_package = MoreStringPackage::new();
    string_package.register_into_engine(&mut engine);
    let array_package = BasicArrayPackage::new();
    array_package.register_into_engine(&mut engine);

    engine.register_fn("is_blank", inside_script::is_blank);

    engine
}

/// Utilities for inside scripts
///
/// Important, don't use the type `String` as function parameters, see
/// https://rhai.rs/book/rust/strings.html
mod inside_script {
    use rhai::ImmutableString;

    pub fn is_blank(value: ImmutableString) -> bool {
        value.trim().is_empty()
    }
}
