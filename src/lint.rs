//! Static checks for property default-value scripts.
//!
//! Linting cannot prove a script safe; it rejects the common mistakes that
//! would otherwise break note processing silently.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

use lru::LruCache;
use regex::Regex;

use crate::js::ast::{
    BinaryOp, Expr, LogicalOp, MemberProp, Stmt, SwitchCase, UnaryOp, Visitor,
    walk_expr, walk_stmt,
};
use crate::js::{SyntaxError, parse_function_body};

pub const MAX_SCRIPT_LEN: usize = 1000;
const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Methods whose result is conventionally a string.
const STRING_METHODS: &[&str] = &[
    "toString",
    "toUpperCase",
    "toLowerCase",
    "toLocaleUpperCase",
    "toLocaleLowerCase",
    "trim",
    "trimStart",
    "trimEnd",
    "join",
    "replace",
    "replaceAll",
    "slice",
    "substring",
    "substr",
    "padStart",
    "padEnd",
    "concat",
    "repeat",
    "charAt",
    "toISOString",
    "toDateString",
    "toLocaleDateString",
    "toLocaleString",
    "toFixed",
    "format",
    "normalize",
    "stringify",
    "now",
    "tomorrow",
    "yesterday",
    "link",
    "prompt",
    "detectLanguage",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LintSeverity {
    Error,
    Warning,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LintReport {
    pub is_valid: bool,
    pub severity: LintSeverity,
    pub message: String,
}

impl LintReport {
    fn error(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            severity: LintSeverity::Error,
            message: message.into(),
        }
    }
}

pub type ParsedScript = Arc<Result<Vec<Stmt>, SyntaxError>>;

/// Linter with an LRU cache of parsed scripts, keyed by source text.
pub struct ScriptLinter {
    cache: Mutex<LruCache<String, ParsedScript>>,
}

impl Default for ScriptLinter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl ScriptLinter {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn parse(&self, source: &str) -> ParsedScript {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(source) {
            return Arc::clone(hit);
        }
        let parsed = Arc::new(parse_function_body(source));
        cache.put(source.to_string(), Arc::clone(&parsed));
        parsed
    }

    pub fn validate(&self, source: &str) -> LintReport {
        validate_with(source, |s| self.parse(s))
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

pub fn validate_script(source: &str) -> LintReport {
    validate_with(source, |s| Arc::new(parse_function_body(s)))
}

fn validate_with(source: &str, parse: impl FnOnce(&str) -> ParsedScript) -> LintReport {
    if source.trim().is_empty() {
        return LintReport::error("Script is empty");
    }

    if let Some(message) = security_issue(source) {
        return LintReport::error(message);
    }

    let parsed = parse(source);
    let body = match parsed.as_ref() {
        Ok(body) => body,
        Err(err) => return LintReport::error(format!("Syntax error: {err}")),
    };

    if !block_returns(body) {
        return LintReport::error("Not all execution paths return a value");
    }

    if let Some(kind) = non_string_return(body) {
        return LintReport::error(format!(
            "Script must return a string, but a {kind} value is returned"
        ));
    }

    let mut warnings = Vec::new();
    let len = source.chars().count();
    if len > MAX_SCRIPT_LEN {
        warnings.push(format!(
            "Script is long ({len} characters); consider simplifying it"
        ));
    }
    if contains_console_call(body) {
        warnings.push("Script contains console logging calls; remove them once debugged".to_string());
    }
    if !warnings.is_empty() {
        return LintReport {
            is_valid: true,
            severity: LintSeverity::Warning,
            message: warnings.join("; "),
        };
    }

    LintReport {
        is_valid: true,
        severity: LintSeverity::Success,
        message: "Script is valid".to_string(),
    }
}

// ---- security ----

struct SecurityRule {
    pattern: Regex,
    message: &'static str,
}

fn security_rules() -> &'static [SecurityRule] {
    static RULES: OnceLock<Vec<SecurityRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"\beval\s*\(",
                "eval() is dangerous: it executes arbitrary code and is not allowed",
            ),
            (
                r"\bFunction\s*\(",
                "The Function constructor is dangerous: it builds code from strings and is not allowed",
            ),
            (
                r"\b(?:setTimeout|setInterval|setImmediate)\s*\(",
                "Timer functions are dangerous here: delayed code runs outside note processing and is not allowed",
            ),
            (
                r"\brequire\s*\(",
                "require() is dangerous: loading modules from scripts is not allowed",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, message)| {
            Regex::new(pattern)
                .ok()
                .map(|pattern| SecurityRule { pattern, message })
        })
        .collect()
    })
}

fn security_issue(source: &str) -> Option<&'static str> {
    security_rules()
        .iter()
        .find(|rule| rule.pattern.is_match(source))
        .map(|rule| rule.message)
}

// ---- reachability ----

/// A statement list always returns when any of its statements does.
pub fn block_returns(stmts: &[Stmt]) -> bool {
    stmts.iter().any(stmt_returns)
}

fn stmt_returns(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Return(_) => true,
        Stmt::Block(stmts) => block_returns(stmts),
        Stmt::If {
            consequent,
            alternate: Some(alternate),
            ..
        } => stmt_returns(consequent) && stmt_returns(alternate),
        Stmt::If { alternate: None, .. } => false,
        Stmt::Switch { cases, .. } => switch_returns(cases),
        Stmt::Try {
            block,
            handler,
            finalizer,
        } => {
            if finalizer.as_deref().is_some_and(block_returns) {
                return true;
            }
            match handler {
                Some(h) => block_returns(block) && block_returns(&h.body),
                None => block_returns(block),
            }
        }
        _ => false,
    }
}

fn breaks(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Break => true,
        Stmt::Block(inner) => breaks(inner),
        _ => false,
    })
}

fn switch_returns(cases: &[SwitchCase]) -> bool {
    if !cases.iter().any(|c| c.test.is_none()) {
        return false;
    }
    // Walk backwards so a fall-through case inherits the case it falls into.
    let mut next_ok = false;
    for case in cases.iter().rev() {
        let ok = block_returns(&case.consequent) || (!breaks(&case.consequent) && next_ok);
        if !ok {
            return false;
        }
        next_ok = ok;
    }
    true
}

// ---- return type heuristic ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnKind {
    StringLike,
    NotString(&'static str),
    Neutral,
}

/// Collects `return` arguments of the script body, not of nested functions.
#[derive(Default)]
struct ReturnCollector<'a> {
    returns: Vec<&'a Expr>,
}

impl<'a> ReturnCollector<'a> {
    fn collect(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Return(Some(e)) => self.returns.push(e),
            Stmt::Block(stmts) => stmts.iter().for_each(|s| self.collect(s)),
            Stmt::If {
                consequent,
                alternate,
                ..
            } => {
                self.collect(consequent);
                if let Some(alt) = alternate {
                    self.collect(alt);
                }
            }
            Stmt::Switch { cases, .. } => {
                for case in cases {
                    case.consequent.iter().for_each(|s| self.collect(s));
                }
            }
            Stmt::Try {
                block,
                handler,
                finalizer,
            } => {
                block.iter().for_each(|s| self.collect(s));
                if let Some(h) = handler {
                    h.body.iter().for_each(|s| self.collect(s));
                }
                if let Some(f) = finalizer {
                    f.iter().for_each(|s| self.collect(s));
                }
            }
            Stmt::For { body, .. }
            | Stmt::ForEach { body, .. }
            | Stmt::While { body, .. }
            | Stmt::DoWhile { body, .. } => self.collect(body),
            _ => {}
        }
    }
}

fn non_string_return(body: &[Stmt]) -> Option<&'static str> {
    let mut collector = ReturnCollector::default();
    body.iter().for_each(|s| collector.collect(s));
    collector
        .returns
        .into_iter()
        .find_map(|e| match classify(e) {
            ReturnKind::NotString(kind) => Some(kind),
            _ => None,
        })
}

fn combine(a: ReturnKind, b: ReturnKind) -> ReturnKind {
    match (a, b) {
        (ReturnKind::StringLike, ReturnKind::StringLike) => ReturnKind::StringLike,
        (ReturnKind::NotString(k), ReturnKind::NotString(_)) => ReturnKind::NotString(k),
        _ => ReturnKind::Neutral,
    }
}

fn classify(expr: &Expr) -> ReturnKind {
    match expr {
        Expr::Str(_) | Expr::Template(_) => ReturnKind::StringLike,
        Expr::Number(_) => ReturnKind::NotString("number"),
        Expr::Bool(_) => ReturnKind::NotString("boolean"),
        Expr::Object(_) => ReturnKind::NotString("object"),
        Expr::Array(_) => ReturnKind::NotString("array"),
        Expr::Regex { .. } => ReturnKind::NotString("regular expression"),
        Expr::Function(_) => ReturnKind::NotString("function"),
        Expr::Null => ReturnKind::Neutral,
        Expr::Ident(name) if name == "undefined" => ReturnKind::Neutral,
        // Context values are conventionally strings.
        Expr::Ident(_) | Expr::Member { .. } => ReturnKind::StringLike,
        Expr::Binary {
            op: BinaryOp::Add,
            left,
            right,
        } => {
            let (l, r) = (classify(left), classify(right));
            if l == ReturnKind::StringLike || r == ReturnKind::StringLike {
                ReturnKind::StringLike
            } else {
                combine(l, r)
            }
        }
        Expr::Binary { op, .. } if op.is_comparison() => ReturnKind::NotString("boolean"),
        Expr::Binary { .. } => ReturnKind::NotString("number"),
        Expr::Unary { op, .. } => match op {
            UnaryOp::Not | UnaryOp::Delete => ReturnKind::NotString("boolean"),
            UnaryOp::Neg | UnaryOp::Plus | UnaryOp::BitNot => ReturnKind::NotString("number"),
            UnaryOp::TypeOf => ReturnKind::StringLike,
            UnaryOp::Void => ReturnKind::Neutral,
        },
        Expr::Update { .. } => ReturnKind::NotString("number"),
        Expr::Conditional {
            consequent,
            alternate,
            ..
        } => combine(classify(consequent), classify(alternate)),
        Expr::Logical { op, left, right } => {
            let (l, r) = (classify(left), classify(right));
            match op {
                LogicalOp::And => combine(l, r),
                LogicalOp::Or | LogicalOp::Nullish => {
                    if l == ReturnKind::StringLike || r == ReturnKind::StringLike {
                        ReturnKind::StringLike
                    } else {
                        combine(l, r)
                    }
                }
            }
        }
        Expr::Call { callee, .. } => match callee.as_ref() {
            Expr::Ident(name) if name == "String" => ReturnKind::StringLike,
            Expr::Member {
                property: MemberProp::Name(name),
                ..
            } if STRING_METHODS.contains(&name.as_str()) => ReturnKind::StringLike,
            _ => ReturnKind::Neutral,
        },
        Expr::Await(inner) => classify(inner),
        Expr::Assign { value, .. } => classify(value),
        Expr::Sequence(items) => items.last().map(classify).unwrap_or(ReturnKind::Neutral),
        Expr::New { .. } | Expr::This | Expr::Spread(_) => ReturnKind::Neutral,
    }
}

// ---- best practice ----

#[derive(Default)]
struct ConsoleFinder {
    found: bool,
}

impl Visitor for ConsoleFinder {
    fn visit_expr(&mut self, expr: &Expr) {
        if let Expr::Call { callee, .. } = expr {
            if let Expr::Member { object, .. } = callee.as_ref() {
                if matches!(object.as_ref(), Expr::Ident(name) if name == "console") {
                    self.found = true;
                    return;
                }
            }
        }
        walk_expr(self, expr);
    }
}

fn contains_console_call(body: &[Stmt]) -> bool {
    let mut finder = ConsoleFinder::default();
    for stmt in body {
        walk_stmt(&mut finder, stmt);
        if finder.found {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_error(src: &str, needle: &str) {
        let report = validate_script(src);
        assert!(!report.is_valid, "{src:?} should be invalid");
        assert_eq!(report.severity, LintSeverity::Error);
        assert!(
            report.message.to_lowercase().contains(&needle.to_lowercase()),
            "{:?} does not mention {needle:?}",
            report.message
        );
    }

    fn assert_success(src: &str) {
        let report = validate_script(src);
        assert!(report.is_valid, "{src:?}: {}", report.message);
        assert_eq!(report.severity, LintSeverity::Success, "{}", report.message);
    }

    #[test]
    fn empty_scripts_are_errors() {
        assert_error("", "empty");
        assert_error("   \n\t", "empty");
    }

    #[test]
    fn if_else_returning_on_both_branches_is_valid() {
        assert_success("if (x) { return 'a'; } else { return 'b'; }");
    }

    #[test]
    fn if_without_else_is_incomplete() {
        assert_error("if (x) { return 'a'; }", "not all execution paths return a value");
    }

    #[test]
    fn switch_requires_default() {
        assert_error(
            "switch (fileClass) { case 'book': return 'b'; }",
            "not all execution paths",
        );
        assert_success(
            "switch (fileClass) { case 'book': case 'novel': return 'b'; default: return 'x'; }",
        );
        assert_error(
            "switch (fileClass) { case 'book': break; default: return 'x'; }",
            "not all execution paths",
        );
    }

    #[test]
    fn try_catch_requires_both_branches() {
        assert_error("try { return 'a'; } catch (e) { }", "not all execution paths");
        assert_success("try { return 'a'; } catch (e) { return ''; }");
        assert_success("try { x(); } finally { return 'done'; }");
    }

    #[test]
    fn trailing_return_after_branches_is_enough() {
        assert_success("if (metadata.title) { return metadata.title; }\nreturn file.basename;");
    }

    #[test]
    fn returns_in_nested_functions_do_not_count() {
        assert_error("const f = () => { return 'a'; };", "not all execution paths");
        assert_success("const xs = tags.map(t => 1);\nreturn xs.join(',');");
    }

    #[test]
    fn security_patterns() {
        assert_error("return eval('1 + 1');", "dangerous");
        assert_error("eval(x)", "eval");
        assert_error("return new Function('return 1')();", "Function constructor");
        assert_error("setTimeout(() => {}, 10); return 'a';", "timer");
        assert_error("const fs = require('fs'); return 'a';", "require");
    }

    #[test]
    fn syntax_errors_carry_details() {
        let report = validate_script("return 'a' +;");
        assert!(!report.is_valid);
        assert!(report.message.starts_with("Syntax error:"));
        assert!(report.message.contains("1:"));
    }

    #[test]
    fn non_string_literals_are_rejected() {
        assert_error("return 42;", "number");
        assert_error("return true;", "boolean");
        assert_error("return { a: 1 };", "object");
        assert_error("if (x) { return 'a'; } else { return 1; }", "number");
        assert_error("return a > b;", "boolean");
    }

    #[test]
    fn string_like_and_neutral_returns_pass() {
        assert_success("return `${file.basename}-note`;");
        assert_success("return 'n' + 1;");
        assert_success("return x ? 'a' : 'b';");
        assert_success("return x ? 'a' : 1;");
        assert_success("return someNumber;");
        assert_success("return metadata.tags.join(', ');");
        assert_success("return await utils.prompt('Author?', '');");
        assert_success("return null;");
        assert_success("return computeSomething();");
    }

    #[test]
    fn console_calls_warn() {
        let report = validate_script("console.log('x');\nreturn 'a';");
        assert!(report.is_valid);
        assert_eq!(report.severity, LintSeverity::Warning);
        assert!(report.message.contains("console"));

        // Mentions in strings or comments are fine.
        assert_success("// console.log('x')\nreturn 'console.log(1)';");
    }

    #[test]
    fn long_scripts_warn() {
        let src = format!("const s = '{}';\nreturn s;", "x".repeat(MAX_SCRIPT_LEN));
        let report = validate_script(&src);
        assert!(report.is_valid);
        assert_eq!(report.severity, LintSeverity::Warning);
        assert!(report.message.contains("long"));
    }

    #[test]
    fn linter_caches_parsed_scripts() {
        let linter = ScriptLinter::with_capacity(2);
        linter.validate("return 'a';");
        linter.validate("return 'a';");
        assert_eq!(linter.cached(), 1);
        linter.validate("return 'b';");
        linter.validate("return 'c';");
        assert_eq!(linter.cached(), 2);
        linter.clear();
        assert_eq!(linter.cached(), 0);
    }
}
