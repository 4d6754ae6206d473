use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use futures::future::BoxFuture;
use regex::Regex;
use tracing::debug;

use super::ast::*;
use crate::script_host::{DayOffset, ScriptUtilities};

const STEP_LIMIT: u64 = 1_000_000;
/// Longest string `repeat` and the padding methods may build, in characters.
const MAX_STRING_CHARS: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct JsRegex {
    pub regex: Regex,
    pub source: String,
    pub global: bool,
}

#[derive(Debug)]
pub struct Closure {
    func: Arc<Function>,
    scopes: Vec<Frame>,
}

#[derive(Debug, Clone)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<JsValue>),
    Object(BTreeMap<String, JsValue>),
    Function(Arc<Closure>),
    /// Built-in function, by qualified name (`Math.floor`, `utils.now`).
    Native(&'static str),
    Regex(Arc<JsRegex>),
    Date(DateTime<Local>),
}

impl PartialEq for JsValue {
    fn eq(&self, other: &Self) -> bool {
        strict_equals(self, other)
    }
}

#[derive(Debug, Clone)]
pub enum Exception {
    /// A catchable JavaScript exception.
    Thrown(JsValue),
    /// Aborts the script; never caught by `try`.
    Fatal(String),
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exception::Fatal(msg) => f.write_str(msg),
            Exception::Thrown(JsValue::Object(map)) if map.contains_key("message") => {
                let name = map.get("name").map(to_string).unwrap_or_else(|| "Error".into());
                let message = map.get("message").map(to_string).unwrap_or_default();
                write!(f, "{name}: {message}")
            }
            Exception::Thrown(value) => write!(f, "Uncaught {}", to_string(value)),
        }
    }
}

type Frame = Arc<Mutex<HashMap<String, JsValue>>>;
type Eval<'a, T> = BoxFuture<'a, Result<T, Exception>>;

enum Completion {
    Normal,
    Return(JsValue),
    Break,
    Continue,
}

fn error_value(name: &str, message: impl Into<String>) -> JsValue {
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), JsValue::String(name.to_string()));
    map.insert("message".to_string(), JsValue::String(message.into()));
    JsValue::Object(map)
}

fn type_error(message: impl Into<String>) -> Exception {
    Exception::Thrown(error_value("TypeError", message))
}

fn range_error(message: impl Into<String>) -> Exception {
    Exception::Thrown(error_value("RangeError", message))
}

fn reference_error(name: &str) -> Exception {
    Exception::Thrown(error_value("ReferenceError", format!("{name} is not defined")))
}

fn natives(prefix: &str, names: &[&'static str]) -> JsValue {
    let mut map = BTreeMap::new();
    for name in names {
        let short = name.strip_prefix(prefix).unwrap_or(name);
        map.insert(short.to_string(), JsValue::Native(name));
    }
    JsValue::Object(map)
}

fn global_frame() -> HashMap<String, JsValue> {
    let mut g = HashMap::new();
    g.insert("undefined".into(), JsValue::Undefined);
    g.insert("NaN".into(), JsValue::Number(f64::NAN));
    g.insert("Infinity".into(), JsValue::Number(f64::INFINITY));
    for name in [
        "String", "Number", "Boolean", "parseInt", "parseFloat", "isNaN", "Date", "Error",
        "TypeError",
    ] {
        g.insert(name.into(), JsValue::Native(name));
    }
    g.insert(
        "Math".into(),
        natives(
            "Math.",
            &[
                "Math.floor", "Math.ceil", "Math.round", "Math.trunc", "Math.abs", "Math.max",
                "Math.min", "Math.pow", "Math.sqrt", "Math.sign",
            ],
        ),
    );
    g.insert("JSON".into(), natives("JSON.", &["JSON.stringify", "JSON.parse"]));
    g.insert(
        "Object".into(),
        natives("Object.", &["Object.keys", "Object.values", "Object.entries"]),
    );
    g.insert("Array".into(), natives("Array.", &["Array.isArray", "Array.from"]));
    g.insert(
        "console".into(),
        natives(
            "console.",
            &["console.log", "console.info", "console.warn", "console.error", "console.debug"],
        ),
    );
    g
}

/// Object exposing the script utilities.
pub fn utils_object() -> JsValue {
    natives(
        "utils.",
        &[
            "utils.prompt",
            "utils.now",
            "utils.tomorrow",
            "utils.yesterday",
            "utils.link",
            "utils.detectLanguage",
        ],
    )
}

/// Runs a parsed function body with `context` bound as top-level variables.
pub async fn run(
    body: &[Stmt],
    context: Vec<(String, JsValue)>,
    utils: Arc<dyn ScriptUtilities>,
) -> Result<JsValue, Exception> {
    let mut interp = Interpreter {
        scopes: vec![
            Arc::new(Mutex::new(global_frame())),
            Arc::new(Mutex::new(context.into_iter().collect())),
        ],
        utils,
        steps: 0,
    };
    interp.push_scope();
    match interp.exec_body(body).await? {
        Completion::Return(v) => Ok(v),
        _ => Ok(JsValue::Undefined),
    }
}

struct Interpreter {
    scopes: Vec<Frame>,
    utils: Arc<dyn ScriptUtilities>,
    steps: u64,
}

impl Interpreter {
    fn tick(&mut self) -> Result<(), Exception> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(Exception::Fatal(
                "script exceeded the execution step limit".into(),
            ));
        }
        Ok(())
    }

    fn push_scope(&mut self) {
        self.scopes.push(Arc::new(Mutex::new(HashMap::new())));
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, value: JsValue) {
        if let Some(frame) = self.scopes.last() {
            frame
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), value);
        }
    }

    fn lookup(&self, name: &str) -> Result<JsValue, Exception> {
        for frame in self.scopes.iter().rev() {
            let guard = frame.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(v) = guard.get(name) {
                return Ok(v.clone());
            }
        }
        Err(reference_error(name))
    }

    fn set_var(&mut self, name: &str, value: JsValue) -> Result<(), Exception> {
        for frame in self.scopes.iter().rev() {
            let mut guard = frame.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = guard.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        Err(reference_error(name))
    }

    fn hoist(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let Stmt::Function(func) = stmt {
                if let Some(name) = &func.name {
                    let closure = self.make_closure(func);
                    self.declare(name, closure);
                }
            }
        }
    }

    fn make_closure(&self, func: &Arc<Function>) -> JsValue {
        JsValue::Function(Arc::new(Closure {
            func: Arc::clone(func),
            scopes: self.scopes.clone(),
        }))
    }

    /// Executes a statement list in the current scope.
    fn exec_body<'a>(&'a mut self, stmts: &'a [Stmt]) -> Eval<'a, Completion> {
        Box::pin(async move {
            self.hoist(stmts);
            for stmt in stmts {
                match self.exec(stmt).await? {
                    Completion::Normal => {}
                    other => return Ok(other),
                }
            }
            Ok(Completion::Normal)
        })
    }

    /// Executes a statement list in a fresh block scope.
    fn exec_block<'a>(&'a mut self, stmts: &'a [Stmt]) -> Eval<'a, Completion> {
        Box::pin(async move {
            self.push_scope();
            let out = self.exec_body(stmts).await;
            self.pop_scope();
            out
        })
    }

    fn bind_pattern<'a>(&'a mut self, pattern: &'a Pattern, value: JsValue) -> Eval<'a, ()> {
        Box::pin(async move {
            match pattern {
                Pattern::Ident(name) => self.declare(name, value),
                Pattern::Object(props) => {
                    if matches!(value, JsValue::Undefined | JsValue::Null) {
                        return Err(type_error(format!(
                            "Cannot destructure '{}' as it is {}.",
                            to_string(&value),
                            to_string(&value)
                        )));
                    }
                    for (key, binding, default) in props {
                        let mut v = get_member(&value, key)?;
                        if matches!(v, JsValue::Undefined) {
                            if let Some(d) = default {
                                v = self.eval(d).await?;
                            }
                        }
                        self.declare(binding, v);
                    }
                }
                Pattern::Array(items) => {
                    let list = iterate(&value, false)?;
                    for (i, item) in items.iter().enumerate() {
                        if let Some(name) = item {
                            let v = list.get(i).cloned().unwrap_or(JsValue::Undefined);
                            self.declare(name, v);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn exec_decls<'a>(&'a mut self, decls: &'a [Declarator]) -> Eval<'a, ()> {
        Box::pin(async move {
            for d in decls {
                let value = match &d.init {
                    Some(e) => self.eval(e).await?,
                    None => JsValue::Undefined,
                };
                self.bind_pattern(&d.target, value).await?;
            }
            Ok(())
        })
    }

    fn exec<'a>(&'a mut self, stmt: &'a Stmt) -> Eval<'a, Completion> {
        Box::pin(async move {
            self.tick()?;
            match stmt {
                Stmt::Expr(e) => {
                    self.eval(e).await?;
                    Ok(Completion::Normal)
                }
                Stmt::Decl(_, decls) => {
                    self.exec_decls(decls).await?;
                    Ok(Completion::Normal)
                }
                // Hoisted by the enclosing body.
                Stmt::Function(_) | Stmt::Empty => Ok(Completion::Normal),
                Stmt::Return(e) => {
                    let v = match e {
                        Some(e) => self.eval(e).await?,
                        None => JsValue::Undefined,
                    };
                    Ok(Completion::Return(v))
                }
                Stmt::If {
                    test,
                    consequent,
                    alternate,
                } => {
                    if truthy(&self.eval(test).await?) {
                        self.exec(consequent).await
                    } else if let Some(alt) = alternate {
                        self.exec(alt).await
                    } else {
                        Ok(Completion::Normal)
                    }
                }
                Stmt::Block(stmts) => self.exec_block(stmts).await,
                Stmt::Switch {
                    discriminant,
                    cases,
                } => self.exec_switch(discriminant, cases).await,
                Stmt::Try {
                    block,
                    handler,
                    finalizer,
                } => {
                    let mut result = self.exec_block(block).await;
                    if let (Err(Exception::Thrown(value)), Some(h)) = (&result, handler) {
                        let value = value.clone();
                        self.push_scope();
                        if let Some(param) = &h.param {
                            self.declare(param, value);
                        }
                        result = self.exec_body(&h.body).await;
                        self.pop_scope();
                    }
                    if let Some(f) = finalizer {
                        match self.exec_block(f).await? {
                            Completion::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    result
                }
                Stmt::Throw(e) => {
                    let v = self.eval(e).await?;
                    Err(Exception::Thrown(v))
                }
                Stmt::Break => Ok(Completion::Break),
                Stmt::Continue => Ok(Completion::Continue),
                Stmt::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    self.push_scope();
                    let out = self.exec_for(init, test, update, body).await;
                    self.pop_scope();
                    out
                }
                Stmt::ForEach {
                    target,
                    iterable,
                    keys,
                    body,
                    ..
                } => {
                    let source = self.eval(iterable).await?;
                    let items = iterate(&source, *keys)?;
                    for item in items {
                        self.tick()?;
                        self.push_scope();
                        let out = match self.bind_pattern(target, item).await {
                            Ok(()) => self.exec(body).await,
                            Err(e) => Err(e),
                        };
                        self.pop_scope();
                        match out? {
                            Completion::Break => break,
                            Completion::Return(v) => return Ok(Completion::Return(v)),
                            Completion::Normal | Completion::Continue => {}
                        }
                    }
                    Ok(Completion::Normal)
                }
                Stmt::While { test, body } => {
                    while truthy(&self.eval(test).await?) {
                        self.tick()?;
                        match self.exec(body).await? {
                            Completion::Break => break,
                            Completion::Return(v) => return Ok(Completion::Return(v)),
                            Completion::Normal | Completion::Continue => {}
                        }
                    }
                    Ok(Completion::Normal)
                }
                Stmt::DoWhile { body, test } => {
                    loop {
                        self.tick()?;
                        match self.exec(body).await? {
                            Completion::Break => break,
                            Completion::Return(v) => return Ok(Completion::Return(v)),
                            Completion::Normal | Completion::Continue => {}
                        }
                        if !truthy(&self.eval(test).await?) {
                            break;
                        }
                    }
                    Ok(Completion::Normal)
                }
            }
        })
    }

    fn exec_for<'a>(
        &'a mut self,
        init: &'a Option<ForInit>,
        test: &'a Option<Expr>,
        update: &'a Option<Expr>,
        body: &'a Stmt,
    ) -> Eval<'a, Completion> {
        Box::pin(async move {
            match init {
                Some(ForInit::Decl(_, decls)) => self.exec_decls(decls).await?,
                Some(ForInit::Expr(e)) => {
                    self.eval(e).await?;
                }
                None => {}
            }
            loop {
                self.tick()?;
                if let Some(t) = test {
                    if !truthy(&self.eval(t).await?) {
                        break;
                    }
                }
                match self.exec(body).await? {
                    Completion::Break => break,
                    Completion::Return(v) => return Ok(Completion::Return(v)),
                    Completion::Normal | Completion::Continue => {}
                }
                if let Some(u) = update {
                    self.eval(u).await?;
                }
            }
            Ok(Completion::Normal)
        })
    }

    fn exec_switch<'a>(
        &'a mut self,
        discriminant: &'a Expr,
        cases: &'a [SwitchCase],
    ) -> Eval<'a, Completion> {
        Box::pin(async move {
            let value = self.eval(discriminant).await?;
            let mut start = None;
            for (i, case) in cases.iter().enumerate() {
                if let Some(test) = &case.test {
                    if strict_equals(&value, &self.eval(test).await?) {
                        start = Some(i);
                        break;
                    }
                }
            }
            let start = start.or_else(|| cases.iter().position(|c| c.test.is_none()));
            let Some(start) = start else {
                return Ok(Completion::Normal);
            };

            self.push_scope();
            let mut out = Ok(Completion::Normal);
            for case in &cases[start..] {
                match self.exec_body(&case.consequent).await {
                    Ok(Completion::Normal) => {}
                    Ok(Completion::Break) => break,
                    other => {
                        out = other;
                        break;
                    }
                }
            }
            self.pop_scope();
            out
        })
    }

    fn call_function<'a>(&'a mut self, callee: JsValue, args: Vec<JsValue>) -> Eval<'a, JsValue> {
        Box::pin(async move {
            self.tick()?;
            match callee {
                JsValue::Function(closure) => {
                    let saved = std::mem::replace(&mut self.scopes, closure.scopes.clone());
                    self.push_scope();
                    let out = self.invoke(&closure, args).await;
                    self.scopes = saved;
                    out
                }
                JsValue::Native(name) => self.call_native(name, args).await,
                other => Err(type_error(format!(
                    "{} is not a function",
                    type_of(&other)
                ))),
            }
        })
    }

    fn invoke<'a>(&'a mut self, closure: &'a Arc<Closure>, args: Vec<JsValue>) -> Eval<'a, JsValue> {
        Box::pin(async move {
            let func = &closure.func;
            if let (Some(name), false) = (&func.name, func.is_arrow) {
                self.declare(name, JsValue::Function(Arc::clone(closure)));
            }
            let mut args = args.into_iter();
            for param in &func.params {
                if param.rest {
                    let rest: Vec<JsValue> = args.by_ref().collect();
                    self.declare(&param.name, JsValue::Array(rest));
                    continue;
                }
                let mut v = args.next().unwrap_or(JsValue::Undefined);
                if matches!(v, JsValue::Undefined) {
                    if let Some(d) = &param.default {
                        v = self.eval(d).await?;
                    }
                }
                self.declare(&param.name, v);
            }
            match &func.body {
                FunctionBody::Expr(e) => self.eval(e).await,
                FunctionBody::Block(stmts) => match self.exec_body(stmts).await? {
                    Completion::Return(v) => Ok(v),
                    _ => Ok(JsValue::Undefined),
                },
            }
        })
    }

    fn eval_args<'a>(&'a mut self, args: &'a [Expr]) -> Eval<'a, Vec<JsValue>> {
        Box::pin(async move {
            let mut out = Vec::with_capacity(args.len());
            for a in args {
                if let Expr::Spread(inner) = a {
                    let v = self.eval(inner).await?;
                    out.extend(iterate(&v, false)?);
                } else {
                    out.push(self.eval(a).await?);
                }
            }
            Ok(out)
        })
    }

    fn member_key<'a>(&'a mut self, prop: &'a MemberProp) -> Eval<'a, String> {
        Box::pin(async move {
            match prop {
                MemberProp::Name(n) => Ok(n.clone()),
                MemberProp::Computed(e) => {
                    let v = self.eval(e).await?;
                    Ok(to_string(&v))
                }
            }
        })
    }

    /// Writes `value` to an assignable expression, rebuilding containers
    /// along a member path.
    fn assign_to<'a>(&'a mut self, target: &'a Expr, value: JsValue) -> Eval<'a, ()> {
        Box::pin(async move {
            match target {
                Expr::Ident(name) => self.set_var(name, value),
                Expr::Member {
                    object, property, ..
                } => {
                    let key = self.member_key(property).await?;
                    let container = self.eval(object).await?;
                    let updated = match container {
                        JsValue::Object(mut map) => {
                            map.insert(key, value);
                            JsValue::Object(map)
                        }
                        JsValue::Array(mut items) => {
                            let Ok(idx) = key.parse::<usize>() else {
                                return Err(type_error(format!("Cannot set property '{key}' of array")));
                            };
                            if idx >= items.len() {
                                items.resize(idx + 1, JsValue::Undefined);
                            }
                            items[idx] = value;
                            JsValue::Array(items)
                        }
                        other => {
                            return Err(type_error(format!(
                                "Cannot set properties of {} (setting '{key}')",
                                to_string(&other)
                            )));
                        }
                    };
                    self.assign_to(object, updated).await
                }
                _ => Err(Exception::Fatal("Invalid assignment target".into())),
            }
        })
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> Eval<'a, JsValue> {
        Box::pin(async move {
            match expr {
                Expr::Number(n) => Ok(JsValue::Number(*n)),
                Expr::Str(s) => Ok(JsValue::String(s.clone())),
                Expr::Bool(b) => Ok(JsValue::Bool(*b)),
                Expr::Null => Ok(JsValue::Null),
                Expr::This => Ok(JsValue::Undefined),
                Expr::Template(parts) => {
                    let mut out = String::new();
                    for p in parts {
                        match p {
                            TemplatePart::Str(s) => out.push_str(s),
                            TemplatePart::Expr(e) => {
                                let v = self.eval(e).await?;
                                out.push_str(&to_string(&v));
                            }
                        }
                    }
                    Ok(JsValue::String(out))
                }
                Expr::Regex { pattern, flags } => compile_regex(pattern, flags),
                Expr::Ident(name) => self.lookup(name),
                Expr::Array(items) => Ok(JsValue::Array(self.eval_args(items).await?)),
                Expr::Object(props) => {
                    let mut map = BTreeMap::new();
                    for p in props {
                        match p {
                            ObjectProp::KeyValue(key, value) => {
                                let key = match key {
                                    PropKey::Named(n) => n.clone(),
                                    PropKey::Computed(e) => {
                                        let v = self.eval(e).await?;
                                        to_string(&v)
                                    }
                                };
                                let v = self.eval(value).await?;
                                map.insert(key, v);
                            }
                            ObjectProp::Spread(e) => {
                                if let JsValue::Object(other) = self.eval(e).await? {
                                    map.extend(other);
                                }
                            }
                        }
                    }
                    Ok(JsValue::Object(map))
                }
                Expr::Function(func) => Ok(self.make_closure(func)),
                Expr::Member {
                    object,
                    property,
                    optional,
                } => {
                    let obj = self.eval(object).await?;
                    if *optional && is_nullish(&obj) {
                        return Ok(JsValue::Undefined);
                    }
                    let key = self.member_key(property).await?;
                    get_member(&obj, &key)
                }
                Expr::Call {
                    callee,
                    args,
                    optional,
                } => self.eval_call(callee, args, *optional).await,
                Expr::New { callee, args } => {
                    let ctor = self.eval(callee).await?;
                    let args = self.eval_args(args).await?;
                    match ctor {
                        JsValue::Native("Date") => new_date(&args),
                        JsValue::Native(name @ ("Error" | "TypeError")) => Ok(error_value(
                            name,
                            args.first().map(to_string).unwrap_or_default(),
                        )),
                        other => Err(type_error(format!(
                            "{} is not a constructor",
                            type_of(&other)
                        ))),
                    }
                }
                Expr::Unary { op, arg } => {
                    if *op == UnaryOp::TypeOf {
                        if let Expr::Ident(name) = arg.as_ref() {
                            let v = self.lookup(name).unwrap_or(JsValue::Undefined);
                            return Ok(JsValue::String(type_of(&v).into()));
                        }
                    }
                    if *op == UnaryOp::Delete {
                        return self.eval_delete(arg).await;
                    }
                    let v = self.eval(arg).await?;
                    Ok(match op {
                        UnaryOp::Not => JsValue::Bool(!truthy(&v)),
                        UnaryOp::Neg => JsValue::Number(-to_number(&v)),
                        UnaryOp::Plus => JsValue::Number(to_number(&v)),
                        UnaryOp::BitNot => JsValue::Number(!(to_int32(&v)) as f64),
                        UnaryOp::TypeOf => JsValue::String(type_of(&v).into()),
                        UnaryOp::Void | UnaryOp::Delete => JsValue::Undefined,
                    })
                }
                Expr::Update {
                    increment,
                    prefix,
                    target,
                } => {
                    let old = to_number(&self.eval(target).await?);
                    let new = if *increment { old + 1.0 } else { old - 1.0 };
                    self.assign_to(target, JsValue::Number(new)).await?;
                    Ok(JsValue::Number(if *prefix { new } else { old }))
                }
                Expr::Binary { op, left, right } => {
                    let l = self.eval(left).await?;
                    let r = self.eval(right).await?;
                    binary(*op, &l, &r)
                }
                Expr::Logical { op, left, right } => {
                    let l = self.eval(left).await?;
                    let short = match op {
                        LogicalOp::And => !truthy(&l),
                        LogicalOp::Or => truthy(&l),
                        LogicalOp::Nullish => !is_nullish(&l),
                    };
                    if short {
                        Ok(l)
                    } else {
                        self.eval(right).await
                    }
                }
                Expr::Conditional {
                    test,
                    consequent,
                    alternate,
                } => {
                    if truthy(&self.eval(test).await?) {
                        self.eval(consequent).await
                    } else {
                        self.eval(alternate).await
                    }
                }
                Expr::Assign { op, target, value } => {
                    let new = match op {
                        AssignOp::Assign => self.eval(value).await?,
                        AssignOp::And | AssignOp::Or | AssignOp::Nullish => {
                            let cur = self.eval(target).await?;
                            let keep = match op {
                                AssignOp::And => !truthy(&cur),
                                AssignOp::Or => truthy(&cur),
                                _ => !is_nullish(&cur),
                            };
                            if keep {
                                return Ok(cur);
                            }
                            self.eval(value).await?
                        }
                        _ => {
                            let cur = self.eval(target).await?;
                            let rhs = self.eval(value).await?;
                            let bop = match op {
                                AssignOp::Add => BinaryOp::Add,
                                AssignOp::Sub => BinaryOp::Sub,
                                AssignOp::Mul => BinaryOp::Mul,
                                AssignOp::Div => BinaryOp::Div,
                                _ => BinaryOp::Rem,
                            };
                            binary(bop, &cur, &rhs)?
                        }
                    };
                    self.assign_to(target, new.clone()).await?;
                    Ok(new)
                }
                // Utilities resolve eagerly, so awaiting is a pass-through.
                Expr::Await(inner) => self.eval(inner).await,
                Expr::Spread(inner) => self.eval(inner).await,
                Expr::Sequence(items) => {
                    let mut last = JsValue::Undefined;
                    for e in items {
                        last = self.eval(e).await?;
                    }
                    Ok(last)
                }
            }
        })
    }

    fn eval_delete<'a>(&'a mut self, target: &'a Expr) -> Eval<'a, JsValue> {
        Box::pin(async move {
            let Expr::Member {
                object, property, ..
            } = target
            else {
                return Ok(JsValue::Bool(true));
            };
            let key = self.member_key(property).await?;
            if let JsValue::Object(mut map) = self.eval(object).await? {
                map.remove(&key);
                self.assign_to(object, JsValue::Object(map)).await?;
            }
            Ok(JsValue::Bool(true))
        })
    }

    fn eval_call<'a>(
        &'a mut self,
        callee: &'a Expr,
        args: &'a [Expr],
        optional: bool,
    ) -> Eval<'a, JsValue> {
        Box::pin(async move {
            let Expr::Member {
                object,
                property,
                optional: member_optional,
            } = callee
            else {
                let f = self.eval(callee).await?;
                if optional && is_nullish(&f) {
                    return Ok(JsValue::Undefined);
                }
                let args = self.eval_args(args).await?;
                return self.call_function(f, args).await;
            };

            let obj = self.eval(object).await?;
            if *member_optional && is_nullish(&obj) {
                return Ok(JsValue::Undefined);
            }
            let key = self.member_key(property).await?;
            match &obj {
                JsValue::String(_)
                | JsValue::Array(_)
                | JsValue::Number(_)
                | JsValue::Regex(_)
                | JsValue::Date(_) => {
                    let args = self.eval_args(args).await?;
                    let (result, mutated) = self.call_method(obj.clone(), &key, args).await?;
                    if let Some(updated) = mutated {
                        if matches!(object.as_ref(), Expr::Ident(_) | Expr::Member { .. }) {
                            self.assign_to(object, updated).await?;
                        }
                    }
                    Ok(result)
                }
                JsValue::Object(map) if key == "hasOwnProperty" && !map.contains_key(&key) => {
                    let args = self.eval_args(args).await?;
                    let k = args.first().map(to_string).unwrap_or_default();
                    Ok(JsValue::Bool(map.contains_key(&k)))
                }
                JsValue::Undefined | JsValue::Null => Err(type_error(format!(
                    "Cannot read properties of {} (reading '{key}')",
                    to_string(&obj)
                ))),
                _ => {
                    let f = get_member(&obj, &key)?;
                    if optional && is_nullish(&f) {
                        return Ok(JsValue::Undefined);
                    }
                    if !matches!(f, JsValue::Function(_) | JsValue::Native(_)) {
                        return Err(type_error(format!("{key} is not a function")));
                    }
                    let args = self.eval_args(args).await?;
                    self.call_function(f, args).await
                }
            }
        })
    }

    /// Built-in methods. Returns the result and, for mutating methods, the
    /// updated receiver.
    fn call_method<'a>(
        &'a mut self,
        obj: JsValue,
        key: &'a str,
        args: Vec<JsValue>,
    ) -> Eval<'a, (JsValue, Option<JsValue>)> {
        Box::pin(async move {
            match obj {
                JsValue::String(s) => Ok((string_method(&s, key, &args)?, None)),
                JsValue::Number(n) => Ok((number_method(n, key, &args)?, None)),
                JsValue::Regex(re) => Ok((regex_method(&re, key, &args)?, None)),
                JsValue::Date(d) => Ok((date_method(&d, key)?, None)),
                JsValue::Array(items) => self.array_method(items, key, args).await,
                other => Err(type_error(format!(
                    "{}.{key} is not a function",
                    type_of(&other)
                ))),
            }
        })
    }

    fn array_method<'a>(
        &'a mut self,
        mut items: Vec<JsValue>,
        key: &'a str,
        args: Vec<JsValue>,
    ) -> Eval<'a, (JsValue, Option<JsValue>)> {
        Box::pin(async move {
            let arg = |i: usize| args.get(i).cloned().unwrap_or(JsValue::Undefined);
            let plain = |v: JsValue| -> Result<(JsValue, Option<JsValue>), Exception> {
                Ok((v, None))
            };
            match key {
                "join" => {
                    let sep = match arg(0) {
                        JsValue::Undefined => ",".to_string(),
                        v => to_string(&v),
                    };
                    let parts: Vec<String> = items
                        .iter()
                        .map(|v| match v {
                            JsValue::Undefined | JsValue::Null => String::new(),
                            v => to_string(v),
                        })
                        .collect();
                    plain(JsValue::String(parts.join(&sep)))
                }
                "includes" => plain(JsValue::Bool(items.iter().any(|v| same_value_zero(v, &arg(0))))),
                "indexOf" => plain(JsValue::Number(
                    items
                        .iter()
                        .position(|v| strict_equals(v, &arg(0)))
                        .map(|i| i as f64)
                        .unwrap_or(-1.0),
                )),
                "slice" => {
                    let (start, end) = slice_range(items.len(), &arg(0), &arg(1));
                    plain(JsValue::Array(items[start..end].to_vec()))
                }
                "at" => {
                    let idx = relative_index(items.len(), &arg(0));
                    plain(idx.and_then(|i| items.get(i).cloned()).unwrap_or(JsValue::Undefined))
                }
                "concat" => {
                    for a in args.iter() {
                        match a {
                            JsValue::Array(more) => items.extend(more.iter().cloned()),
                            other => items.push(other.clone()),
                        }
                    }
                    plain(JsValue::Array(items))
                }
                "flat" => {
                    let mut out = Vec::new();
                    for v in items {
                        match v {
                            JsValue::Array(inner) => out.extend(inner),
                            other => out.push(other),
                        }
                    }
                    plain(JsValue::Array(out))
                }
                "push" => {
                    items.extend(args.iter().cloned());
                    let len = items.len() as f64;
                    Ok((JsValue::Number(len), Some(JsValue::Array(items))))
                }
                "unshift" => {
                    let mut out = args.clone();
                    out.extend(items);
                    let len = out.len() as f64;
                    Ok((JsValue::Number(len), Some(JsValue::Array(out))))
                }
                "pop" => {
                    let v = items.pop().unwrap_or(JsValue::Undefined);
                    Ok((v, Some(JsValue::Array(items))))
                }
                "shift" => {
                    let v = if items.is_empty() {
                        JsValue::Undefined
                    } else {
                        items.remove(0)
                    };
                    Ok((v, Some(JsValue::Array(items))))
                }
                "reverse" => {
                    items.reverse();
                    let arr = JsValue::Array(items);
                    Ok((arr.clone(), Some(arr)))
                }
                "sort" => {
                    let cmp = arg(0);
                    if matches!(cmp, JsValue::Undefined) {
                        items.sort_by_key(to_string);
                    } else {
                        // Insertion sort keeps comparator calls sequential.
                        for i in 1..items.len() {
                            let mut j = i;
                            while j > 0 {
                                let order = self
                                    .call_function(cmp.clone(), vec![items[j - 1].clone(), items[j].clone()])
                                    .await?;
                                if to_number(&order) > 0.0 {
                                    items.swap(j - 1, j);
                                    j -= 1;
                                } else {
                                    break;
                                }
                            }
                        }
                    }
                    let arr = JsValue::Array(items);
                    Ok((arr.clone(), Some(arr)))
                }
                "map" | "filter" | "find" | "findIndex" | "some" | "every" | "forEach" => {
                    let f = arg(0);
                    let mut mapped = Vec::new();
                    for (i, v) in items.iter().enumerate() {
                        let r = self
                            .call_function(f.clone(), vec![v.clone(), JsValue::Number(i as f64)])
                            .await?;
                        match key {
                            "map" => mapped.push(r),
                            "filter" if truthy(&r) => mapped.push(v.clone()),
                            "find" if truthy(&r) => return plain(v.clone()),
                            "findIndex" if truthy(&r) => return plain(JsValue::Number(i as f64)),
                            "some" if truthy(&r) => return plain(JsValue::Bool(true)),
                            "every" if !truthy(&r) => return plain(JsValue::Bool(false)),
                            _ => {}
                        }
                    }
                    plain(match key {
                        "map" | "filter" => JsValue::Array(mapped),
                        "find" | "forEach" => JsValue::Undefined,
                        "findIndex" => JsValue::Number(-1.0),
                        "some" => JsValue::Bool(false),
                        _ => JsValue::Bool(true),
                    })
                }
                "reduce" => {
                    let f = arg(0);
                    let mut iter = items.into_iter().enumerate();
                    let mut acc = if args.len() > 1 {
                        arg(1)
                    } else {
                        match iter.next() {
                            Some((_, v)) => v,
                            None => {
                                return Err(type_error("Reduce of empty array with no initial value"));
                            }
                        }
                    };
                    for (i, v) in iter {
                        acc = self
                            .call_function(f.clone(), vec![acc, v, JsValue::Number(i as f64)])
                            .await?;
                    }
                    plain(acc)
                }
                "toString" => plain(JsValue::String(to_string(&JsValue::Array(items)))),
                _ => Err(type_error(format!("array.{key} is not a function"))),
            }
        })
    }

    fn call_native<'a>(&'a mut self, name: &'static str, args: Vec<JsValue>) -> Eval<'a, JsValue> {
        Box::pin(async move {
            let arg = |i: usize| args.get(i).cloned().unwrap_or(JsValue::Undefined);
            let opt_str = |i: usize| match args.get(i) {
                None | Some(JsValue::Undefined) | Some(JsValue::Null) => None,
                Some(v) => Some(to_string(v)),
            };
            let math = |f: fn(f64) -> f64| Ok(JsValue::Number(f(to_number(&arg(0)))));
            match name {
                "utils.prompt" => {
                    let message = opt_str(0).unwrap_or_default();
                    let default = opt_str(1).unwrap_or_default();
                    self.utils
                        .prompt(&message, &default)
                        .await
                        .map(JsValue::String)
                        .map_err(|e| Exception::Thrown(error_value("Error", e.to_string())))
                }
                "utils.now" | "utils.tomorrow" | "utils.yesterday" => {
                    let offset = match name {
                        "utils.tomorrow" => DayOffset::Tomorrow,
                        "utils.yesterday" => DayOffset::Yesterday,
                        _ => DayOffset::Today,
                    };
                    let format = opt_str(0);
                    Ok(JsValue::String(self.utils.date(offset, format.as_deref())))
                }
                "utils.link" => {
                    let target = opt_str(0).unwrap_or_default();
                    let alias = opt_str(1);
                    Ok(JsValue::String(self.utils.markdown_link(&target, alias.as_deref())))
                }
                "utils.detectLanguage" => {
                    let text = opt_str(0).unwrap_or_default();
                    Ok(JsValue::String(self.utils.detect_language(&text)))
                }
                "String" => Ok(JsValue::String(match args.first() {
                    None => String::new(),
                    Some(v) => to_string(v),
                })),
                "Number" => Ok(JsValue::Number(args.first().map(to_number).unwrap_or(0.0))),
                "Boolean" => Ok(JsValue::Bool(truthy(&arg(0)))),
                "parseInt" => Ok(JsValue::Number(parse_int(&to_string(&arg(0))))),
                "parseFloat" => Ok(JsValue::Number(parse_float(&to_string(&arg(0))))),
                "isNaN" => Ok(JsValue::Bool(to_number(&arg(0)).is_nan())),
                "Date" => Ok(JsValue::String(date_to_string(&Local::now()))),
                "Date.now" => Ok(JsValue::Number(Utc::now().timestamp_millis() as f64)),
                "Error" | "TypeError" => Ok(error_value(name, opt_str(0).unwrap_or_default())),
                "Math.floor" => math(f64::floor),
                "Math.ceil" => math(f64::ceil),
                "Math.round" => math(|n| (n + 0.5).floor()),
                "Math.trunc" => math(f64::trunc),
                "Math.abs" => math(f64::abs),
                "Math.sqrt" => math(f64::sqrt),
                "Math.sign" => math(|n| if n == 0.0 || n.is_nan() { n } else { n.signum() }),
                "Math.pow" => Ok(JsValue::Number(to_number(&arg(0)).powf(to_number(&arg(1))))),
                "Math.max" => Ok(JsValue::Number(
                    args.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max),
                )),
                "Math.min" => Ok(JsValue::Number(
                    args.iter().map(to_number).fold(f64::INFINITY, f64::min),
                )),
                "JSON.stringify" => {
                    let json = to_json(&arg(0));
                    let text = if matches!(arg(2), JsValue::Undefined) {
                        serde_json::to_string(&json)
                    } else {
                        serde_json::to_string_pretty(&json)
                    };
                    text.map(JsValue::String)
                        .map_err(|e| type_error(e.to_string()))
                }
                "JSON.parse" => serde_json::from_str::<serde_json::Value>(&to_string(&arg(0)))
                    .map(|v| from_json(&v))
                    .map_err(|e| Exception::Thrown(error_value("SyntaxError", e.to_string()))),
                "Object.keys" | "Object.values" | "Object.entries" => {
                    let JsValue::Object(map) = arg(0) else {
                        return Ok(JsValue::Array(Vec::new()));
                    };
                    Ok(JsValue::Array(
                        map.into_iter()
                            .map(|(k, v)| match name {
                                "Object.keys" => JsValue::String(k),
                                "Object.values" => v,
                                _ => JsValue::Array(vec![JsValue::String(k), v]),
                            })
                            .collect(),
                    ))
                }
                "Array.isArray" => Ok(JsValue::Bool(matches!(arg(0), JsValue::Array(_)))),
                "Array.from" => Ok(JsValue::Array(iterate(&arg(0), false).unwrap_or_default())),
                "console.log" | "console.info" | "console.warn" | "console.error"
                | "console.debug" => {
                    let line: Vec<String> = args.iter().map(to_string).collect();
                    debug!(target: "oxiprops::script", "{}", line.join(" "));
                    Ok(JsValue::Undefined)
                }
                other => Err(type_error(format!("{other} is not a function"))),
            }
        })
    }
}

// ---- value helpers ----

pub fn is_nullish(v: &JsValue) -> bool {
    matches!(v, JsValue::Undefined | JsValue::Null)
}

pub fn truthy(v: &JsValue) -> bool {
    match v {
        JsValue::Undefined | JsValue::Null => false,
        JsValue::Bool(b) => *b,
        JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
        JsValue::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn type_of(v: &JsValue) -> &'static str {
    match v {
        JsValue::Undefined => "undefined",
        JsValue::Bool(_) => "boolean",
        JsValue::Number(_) => "number",
        JsValue::String(_) => "string",
        JsValue::Function(_) | JsValue::Native(_) => "function",
        _ => "object",
    }
}

pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

pub fn to_string(v: &JsValue) -> String {
    match v {
        JsValue::Undefined => "undefined".into(),
        JsValue::Null => "null".into(),
        JsValue::Bool(b) => b.to_string(),
        JsValue::Number(n) => number_to_string(*n),
        JsValue::String(s) => s.clone(),
        JsValue::Array(items) => items
            .iter()
            .map(|v| if is_nullish(v) { String::new() } else { to_string(v) })
            .collect::<Vec<_>>()
            .join(","),
        JsValue::Object(_) => "[object Object]".into(),
        JsValue::Function(_) | JsValue::Native(_) => "function () { [code] }".into(),
        JsValue::Regex(re) => re.source.clone(),
        JsValue::Date(d) => date_to_string(d),
    }
}

pub fn to_number(v: &JsValue) -> f64 {
    match v {
        JsValue::Undefined => f64::NAN,
        JsValue::Null => 0.0,
        JsValue::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        JsValue::Number(n) => *n,
        JsValue::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                0.0
            } else {
                t.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        JsValue::Date(d) => d.timestamp_millis() as f64,
        JsValue::Array(items) if items.is_empty() => 0.0,
        JsValue::Array(items) if items.len() == 1 => to_number(&items[0]),
        _ => f64::NAN,
    }
}

fn to_int32(v: &JsValue) -> i32 {
    let n = to_number(v);
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64) as i32
}

fn strict_equals(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
        (JsValue::Bool(x), JsValue::Bool(y)) => x == y,
        (JsValue::Number(x), JsValue::Number(y)) => x == y,
        (JsValue::String(x), JsValue::String(y)) => x == y,
        (JsValue::Array(x), JsValue::Array(y)) => x == y,
        (JsValue::Object(x), JsValue::Object(y)) => x == y,
        (JsValue::Function(x), JsValue::Function(y)) => Arc::ptr_eq(x, y),
        (JsValue::Native(x), JsValue::Native(y)) => x == y,
        (JsValue::Regex(x), JsValue::Regex(y)) => Arc::ptr_eq(x, y),
        (JsValue::Date(x), JsValue::Date(y)) => x == y,
        _ => false,
    }
}

fn same_value_zero(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (JsValue::Number(x), JsValue::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => strict_equals(a, b),
    }
}

fn loose_equals(a: &JsValue, b: &JsValue) -> bool {
    match (a, b) {
        (x, y) if is_nullish(x) && is_nullish(y) => true,
        (x, y) if is_nullish(x) || is_nullish(y) => false,
        (JsValue::Number(_), JsValue::String(_))
        | (JsValue::String(_), JsValue::Number(_))
        | (JsValue::Bool(_), _)
        | (_, JsValue::Bool(_)) => to_number(a) == to_number(b),
        _ => strict_equals(a, b),
    }
}

fn binary(op: BinaryOp, l: &JsValue, r: &JsValue) -> Result<JsValue, Exception> {
    let num = |f: fn(f64, f64) -> f64| JsValue::Number(f(to_number(l), to_number(r)));
    let int = |f: fn(i32, i32) -> i32| JsValue::Number(f(to_int32(l), to_int32(r)) as f64);
    Ok(match op {
        BinaryOp::Add => {
            let stringy = |v: &JsValue| {
                matches!(
                    v,
                    JsValue::String(_) | JsValue::Array(_) | JsValue::Object(_) | JsValue::Date(_)
                )
            };
            if stringy(l) || stringy(r) {
                JsValue::String(format!("{}{}", to_string(l), to_string(r)))
            } else {
                num(|a, b| a + b)
            }
        }
        BinaryOp::Sub => num(|a, b| a - b),
        BinaryOp::Mul => num(|a, b| a * b),
        BinaryOp::Div => num(|a, b| a / b),
        BinaryOp::Rem => num(|a, b| a % b),
        BinaryOp::Exp => num(f64::powf),
        BinaryOp::StrictEq => JsValue::Bool(strict_equals(l, r)),
        BinaryOp::StrictNotEq => JsValue::Bool(!strict_equals(l, r)),
        BinaryOp::Eq => JsValue::Bool(loose_equals(l, r)),
        BinaryOp::NotEq => JsValue::Bool(!loose_equals(l, r)),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
            let ord = match (l, r) {
                (JsValue::String(a), JsValue::String(b)) => Some(a.cmp(b)),
                _ => to_number(l).partial_cmp(&to_number(r)),
            };
            let Some(ord) = ord else {
                return Ok(JsValue::Bool(false));
            };
            JsValue::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Gt => ord.is_gt(),
                BinaryOp::LtEq => ord.is_le(),
                _ => ord.is_ge(),
            })
        }
        BinaryOp::BitAnd => int(|a, b| a & b),
        BinaryOp::BitOr => int(|a, b| a | b),
        BinaryOp::BitXor => int(|a, b| a ^ b),
        BinaryOp::Shl => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        BinaryOp::Shr => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        BinaryOp::UShr => {
            JsValue::Number(((to_int32(l) as u32) >> (to_int32(r) as u32 & 31)) as f64)
        }
        BinaryOp::In => {
            let key = to_string(l);
            match r {
                JsValue::Object(map) => JsValue::Bool(map.contains_key(&key)),
                JsValue::Array(items) => {
                    JsValue::Bool(key.parse::<usize>().is_ok_and(|i| i < items.len()))
                }
                other => {
                    return Err(type_error(format!(
                        "Cannot use 'in' operator to search for '{key}' in {}",
                        to_string(other)
                    )));
                }
            }
        }
        BinaryOp::InstanceOf => JsValue::Bool(matches!(
            (l, r),
            (JsValue::Array(_), JsValue::Object(_))
                | (JsValue::Date(_), JsValue::Native("Date"))
        )),
    })
}

fn get_member(obj: &JsValue, key: &str) -> Result<JsValue, Exception> {
    Ok(match obj {
        JsValue::Undefined | JsValue::Null => {
            return Err(type_error(format!(
                "Cannot read properties of {} (reading '{key}')",
                to_string(obj)
            )));
        }
        JsValue::String(s) => match key {
            "length" => JsValue::Number(s.chars().count() as f64),
            _ => key
                .parse::<usize>()
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| JsValue::String(c.to_string()))
                .unwrap_or(JsValue::Undefined),
        },
        JsValue::Array(items) => match key {
            "length" => JsValue::Number(items.len() as f64),
            _ => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(JsValue::Undefined),
        },
        JsValue::Object(map) => map.get(key).cloned().unwrap_or(JsValue::Undefined),
        JsValue::Native("Date") if key == "now" => JsValue::Native("Date.now"),
        JsValue::Regex(re) => match key {
            "source" => JsValue::String(re.source.clone()),
            "global" => JsValue::Bool(re.global),
            _ => JsValue::Undefined,
        },
        _ => JsValue::Undefined,
    })
}

fn iterate(v: &JsValue, keys: bool) -> Result<Vec<JsValue>, Exception> {
    match v {
        JsValue::Array(items) if keys => Ok((0..items.len())
            .map(|i| JsValue::String(i.to_string()))
            .collect()),
        JsValue::Array(items) => Ok(items.clone()),
        JsValue::String(s) if keys => Ok((0..s.chars().count())
            .map(|i| JsValue::String(i.to_string()))
            .collect()),
        JsValue::String(s) => Ok(s.chars().map(|c| JsValue::String(c.to_string())).collect()),
        JsValue::Object(map) if keys => Ok(map.keys().cloned().map(JsValue::String).collect()),
        JsValue::Undefined | JsValue::Null if keys => Ok(Vec::new()),
        other => Err(type_error(format!("{} is not iterable", to_string(other)))),
    }
}

fn relative_index(len: usize, v: &JsValue) -> Option<usize> {
    let n = to_number(v);
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    let idx = if n < 0.0 { len as f64 + n } else { n };
    (idx >= 0.0 && (idx as usize) < len).then_some(idx as usize)
}

fn slice_range(len: usize, start: &JsValue, end: &JsValue) -> (usize, usize) {
    let clamp = |v: &JsValue, default: usize| -> usize {
        if matches!(v, JsValue::Undefined) {
            return default;
        }
        let n = to_number(v);
        let n = if n.is_nan() { 0.0 } else { n.trunc() };
        if n < 0.0 {
            (len as f64 + n).max(0.0) as usize
        } else {
            (n as usize).min(len)
        }
    };
    let s = clamp(start, 0);
    let e = clamp(end, len);
    (s, e.max(s))
}

fn compile_regex(pattern: &str, flags: &str) -> Result<JsValue, Exception> {
    let mut inline = String::new();
    for f in flags.chars() {
        match f {
            'i' | 'm' | 's' => inline.push(f),
            'g' | 'u' | 'y' | 'd' => {}
            other => {
                return Err(Exception::Thrown(error_value(
                    "SyntaxError",
                    format!("Invalid regular expression flags '{other}'"),
                )));
            }
        }
    }
    let full = if inline.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{inline}){pattern}")
    };
    let regex = Regex::new(&full).map_err(|e| {
        Exception::Thrown(error_value(
            "SyntaxError",
            format!("Invalid regular expression /{pattern}/: {e}"),
        ))
    })?;
    Ok(JsValue::Regex(Arc::new(JsRegex {
        regex,
        source: pattern.to_string(),
        global: flags.contains('g'),
    })))
}

/// Translates `$1`/`$&` replacement syntax to the regex crate's.
fn js_replacement(rep: &str) -> String {
    let mut out = String::new();
    let mut chars = rep.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(d) if d.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    num.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{num}}}"));
            }
            _ => out.push_str("$$"),
        }
    }
    out
}

fn match_array(caps: &regex::Captures<'_>) -> JsValue {
    JsValue::Array(
        caps.iter()
            .map(|m| {
                m.map(|m| JsValue::String(m.as_str().to_string()))
                    .unwrap_or(JsValue::Undefined)
            })
            .collect(),
    )
}

fn string_method(s: &str, key: &str, args: &[JsValue]) -> Result<JsValue, Exception> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(JsValue::Undefined);
    let str_arg = |i: usize| to_string(&arg(i));
    let chars: Vec<char> = s.chars().collect();
    let char_index = |byte_idx: usize| s[..byte_idx].chars().count() as f64;
    let pad = |at_start: bool| -> Result<JsValue, Exception> {
        let target = to_number(&arg(0));
        let fill = match arg(1) {
            JsValue::Undefined => " ".to_string(),
            v => to_string(&v),
        };
        if target.is_nan() || target <= chars.len() as f64 || fill.is_empty() {
            return Ok(JsValue::String(s.to_string()));
        }
        if target > MAX_STRING_CHARS as f64 {
            return Err(range_error("Invalid string length"));
        }
        let padding: String = fill
            .chars()
            .cycle()
            .take(target as usize - chars.len())
            .collect();
        Ok(JsValue::String(if at_start {
            format!("{padding}{s}")
        } else {
            format!("{s}{padding}")
        }))
    };

    Ok(match key {
        "toUpperCase" | "toLocaleUpperCase" => JsValue::String(s.to_uppercase()),
        "toLowerCase" | "toLocaleLowerCase" => JsValue::String(s.to_lowercase()),
        "trim" => JsValue::String(s.trim().to_string()),
        "trimStart" => JsValue::String(s.trim_start().to_string()),
        "trimEnd" => JsValue::String(s.trim_end().to_string()),
        "toString" | "valueOf" | "normalize" => JsValue::String(s.to_string()),
        "slice" => {
            let (a, b) = slice_range(chars.len(), &arg(0), &arg(1));
            JsValue::String(chars[a..b].iter().collect())
        }
        "substring" => {
            let bound = |v: &JsValue, default: usize| -> usize {
                if matches!(v, JsValue::Undefined) {
                    return default;
                }
                let n = to_number(v);
                if n.is_nan() || n < 0.0 { 0 } else { (n as usize).min(chars.len()) }
            };
            let a = bound(&arg(0), 0);
            let b = bound(&arg(1), chars.len());
            let (a, b) = if a > b { (b, a) } else { (a, b) };
            JsValue::String(chars[a..b].iter().collect())
        }
        "substr" => {
            let (start, _) = slice_range(chars.len(), &arg(0), &JsValue::Undefined);
            let len = match arg(1) {
                JsValue::Undefined => chars.len(),
                v => to_number(&v).max(0.0) as usize,
            };
            JsValue::String(chars[start..].iter().take(len).collect())
        }
        "charAt" => {
            let i = to_number(&arg(0));
            let i = if i.is_nan() { 0 } else { i as usize };
            JsValue::String(chars.get(i).map(|c| c.to_string()).unwrap_or_default())
        }
        "at" => relative_index(chars.len(), &arg(0))
            .map(|i| JsValue::String(chars[i].to_string()))
            .unwrap_or(JsValue::Undefined),
        "includes" => JsValue::Bool(s.contains(&str_arg(0))),
        "startsWith" => JsValue::Bool(s.starts_with(&str_arg(0))),
        "endsWith" => JsValue::Bool(s.ends_with(&str_arg(0))),
        "indexOf" => JsValue::Number(s.find(&str_arg(0)).map(char_index).unwrap_or(-1.0)),
        "lastIndexOf" => JsValue::Number(s.rfind(&str_arg(0)).map(char_index).unwrap_or(-1.0)),
        "repeat" => {
            let count = to_number(&arg(0));
            let count = if count.is_nan() { 0.0 } else { count.trunc() };
            if count < 0.0 || count.is_infinite() {
                return Err(range_error(format!("Invalid count value: {}", to_string(&arg(0)))));
            }
            if count * chars.len() as f64 > MAX_STRING_CHARS as f64 {
                return Err(range_error("Invalid string length"));
            }
            JsValue::String(s.repeat(count as usize))
        }
        "padStart" => pad(true)?,
        "padEnd" => pad(false)?,
        "concat" => JsValue::String(
            std::iter::once(s.to_string())
                .chain(args.iter().map(to_string))
                .collect(),
        ),
        "localeCompare" => JsValue::Number(match s.cmp(&str_arg(0)) {
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => 1.0,
        }),
        "split" => match arg(0) {
            JsValue::Undefined => JsValue::Array(vec![JsValue::String(s.to_string())]),
            JsValue::Regex(re) => JsValue::Array(
                re.regex
                    .split(s)
                    .map(|p| JsValue::String(p.to_string()))
                    .collect(),
            ),
            sep => {
                let sep = to_string(&sep);
                let parts: Vec<JsValue> = if sep.is_empty() {
                    chars.iter().map(|c| JsValue::String(c.to_string())).collect()
                } else {
                    s.split(sep.as_str())
                        .map(|p| JsValue::String(p.to_string()))
                        .collect()
                };
                match arg(1) {
                    JsValue::Undefined => JsValue::Array(parts),
                    limit => JsValue::Array(
                        parts
                            .into_iter()
                            .take(to_number(&limit).max(0.0) as usize)
                            .collect(),
                    ),
                }
            }
        },
        "replace" | "replaceAll" => {
            let rep = arg(1);
            if matches!(rep, JsValue::Function(_) | JsValue::Native(_)) {
                return Err(type_error("replacement functions are not supported"));
            }
            let rep = to_string(&rep);
            match arg(0) {
                JsValue::Regex(re) => {
                    let rep = js_replacement(&rep);
                    let out = if re.global || key == "replaceAll" {
                        re.regex.replace_all(s, rep.as_str())
                    } else {
                        re.regex.replace(s, rep.as_str())
                    };
                    JsValue::String(out.into_owned())
                }
                pat => {
                    let pat = to_string(&pat);
                    JsValue::String(if key == "replaceAll" {
                        s.replace(&pat, &rep)
                    } else {
                        s.replacen(&pat, &rep, 1)
                    })
                }
            }
        }
        "match" => match arg(0) {
            JsValue::Regex(re) if re.global => {
                let all: Vec<JsValue> = re
                    .regex
                    .find_iter(s)
                    .map(|m| JsValue::String(m.as_str().to_string()))
                    .collect();
                if all.is_empty() { JsValue::Null } else { JsValue::Array(all) }
            }
            JsValue::Regex(re) => re
                .regex
                .captures(s)
                .map(|c| match_array(&c))
                .unwrap_or(JsValue::Null),
            other => {
                let needle = to_string(&other);
                if s.contains(&needle) {
                    JsValue::Array(vec![JsValue::String(needle)])
                } else {
                    JsValue::Null
                }
            }
        },
        _ => return Err(type_error(format!("string.{key} is not a function"))),
    })
}

fn number_method(n: f64, key: &str, args: &[JsValue]) -> Result<JsValue, Exception> {
    Ok(match key {
        "toFixed" => {
            let digits = args.first().map(to_number).unwrap_or(0.0).clamp(0.0, 100.0) as usize;
            JsValue::String(format!("{n:.digits$}"))
        }
        "toString" | "toLocaleString" | "valueOf" => JsValue::String(number_to_string(n)),
        _ => return Err(type_error(format!("number.{key} is not a function"))),
    })
}

fn regex_method(re: &JsRegex, key: &str, args: &[JsValue]) -> Result<JsValue, Exception> {
    let input = args.first().map(to_string).unwrap_or_else(|| "undefined".into());
    Ok(match key {
        "test" => JsValue::Bool(re.regex.is_match(&input)),
        "exec" => re
            .regex
            .captures(&input)
            .map(|c| match_array(&c))
            .unwrap_or(JsValue::Null),
        "toString" => JsValue::String(format!("/{}/", re.source)),
        _ => return Err(type_error(format!("regex.{key} is not a function"))),
    })
}

fn date_to_string(d: &DateTime<Local>) -> String {
    d.format("%a %b %d %Y %H:%M:%S GMT%z").to_string()
}

fn new_date(args: &[JsValue]) -> Result<JsValue, Exception> {
    let date = match args.first() {
        None => Some(Local::now()),
        Some(JsValue::Number(ms)) => Local.timestamp_millis_opt(*ms as i64).single(),
        Some(JsValue::Date(d)) => Some(*d),
        Some(other) => parse_date(&to_string(other)),
    };
    date.map(JsValue::Date)
        .ok_or_else(|| Exception::Thrown(error_value("RangeError", "Invalid Date")))
}

fn parse_date(s: &str) -> Option<DateTime<Local>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Local));
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Local.from_local_datetime(&d).single();
    }
    // Date-only strings are UTC midnight.
    let d = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    let dt = d.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&dt).with_timezone(&Local))
}

fn date_method(d: &DateTime<Local>, key: &str) -> Result<JsValue, Exception> {
    let n = |v: u32| JsValue::Number(v as f64);
    Ok(match key {
        "toISOString" | "toJSON" => JsValue::String(
            d.with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
        ),
        "getFullYear" => JsValue::Number(d.year() as f64),
        "getMonth" => n(d.month0()),
        "getDate" => n(d.day()),
        "getDay" => n(d.weekday().num_days_from_sunday()),
        "getHours" => n(d.hour()),
        "getMinutes" => n(d.minute()),
        "getSeconds" => n(d.second()),
        "getTime" | "valueOf" => JsValue::Number(d.timestamp_millis() as f64),
        "toDateString" => JsValue::String(d.format("%a %b %d %Y").to_string()),
        "toLocaleDateString" => JsValue::String(d.format("%-m/%-d/%Y").to_string()),
        "toLocaleTimeString" => JsValue::String(d.format("%-I:%M:%S %p").to_string()),
        "toLocaleString" => JsValue::String(d.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string()),
        "toString" => JsValue::String(date_to_string(d)),
        _ => return Err(type_error(format!("date.{key} is not a function"))),
    })
}

fn parse_int(s: &str) -> f64 {
    let t = s.trim_start();
    let (neg, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let digits: String = t.chars().take_while(char::is_ascii_digit).collect();
    match digits.parse::<f64>() {
        Ok(n) if neg => -n,
        Ok(n) => n,
        Err(_) => f64::NAN,
    }
}

fn parse_float(s: &str) -> f64 {
    let t = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in t.char_indices() {
        let ok = c.is_ascii_digit()
            || (c == '.' && !seen_dot)
            || ((c == '-' || c == '+') && i == 0);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        end = i + c.len_utf8();
    }
    t[..end].parse::<f64>().unwrap_or(f64::NAN)
}

// ---- conversions ----

pub fn from_yaml(v: &serde_yaml::Value) -> JsValue {
    match v {
        serde_yaml::Value::Null => JsValue::Null,
        serde_yaml::Value::Bool(b) => JsValue::Bool(*b),
        serde_yaml::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_yaml::Value::String(s) => JsValue::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => JsValue::Array(seq.iter().map(from_yaml).collect()),
        serde_yaml::Value::Mapping(map) => JsValue::Object(
            map.iter()
                .map(|(k, v)| {
                    let key = match k {
                        serde_yaml::Value::String(s) => s.clone(),
                        other => to_string(&from_yaml(other)),
                    };
                    (key, from_yaml(v))
                })
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => from_yaml(&tagged.value),
    }
}

pub fn to_yaml(v: &JsValue) -> serde_yaml::Value {
    match v {
        JsValue::Undefined | JsValue::Null | JsValue::Function(_) | JsValue::Native(_) => {
            serde_yaml::Value::Null
        }
        JsValue::Bool(b) => serde_yaml::Value::Bool(*b),
        JsValue::Number(n) if n.is_nan() || n.is_infinite() => serde_yaml::Value::Null,
        JsValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
            serde_yaml::Value::Number((*n as i64).into())
        }
        JsValue::Number(n) => serde_yaml::Value::Number((*n).into()),
        JsValue::String(s) => serde_yaml::Value::String(s.clone()),
        JsValue::Array(items) => serde_yaml::Value::Sequence(items.iter().map(to_yaml).collect()),
        JsValue::Object(map) => serde_yaml::Value::Mapping(
            map.iter()
                .map(|(k, v)| (serde_yaml::Value::String(k.clone()), to_yaml(v)))
                .collect(),
        ),
        JsValue::Regex(re) => serde_yaml::Value::String(format!("/{}/", re.source)),
        JsValue::Date(d) => serde_yaml::Value::String(
            d.with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
        ),
    }
}

fn to_json(v: &JsValue) -> serde_json::Value {
    match v {
        JsValue::Undefined | JsValue::Null | JsValue::Function(_) | JsValue::Native(_) => {
            serde_json::Value::Null
        }
        JsValue::Bool(b) => serde_json::Value::Bool(*b),
        JsValue::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => {
            serde_json::Value::from(*n as i64)
        }
        JsValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        JsValue::String(s) => serde_json::Value::String(s.clone()),
        JsValue::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        JsValue::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
        other => serde_json::Value::String(to_string(other)),
    }
}

fn from_json(v: &serde_json::Value) -> JsValue {
    match v {
        serde_json::Value::Null => JsValue::Null,
        serde_json::Value::Bool(b) => JsValue::Bool(*b),
        serde_json::Value::Number(n) => JsValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => JsValue::String(s.clone()),
        serde_json::Value::Array(items) => JsValue::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => JsValue::Object(
            map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::parse_function_body;
    use crate::templating::ChronoTemplating;

    async fn run_src(src: &str) -> Result<JsValue, Exception> {
        let body = parse_function_body(src).expect("parse");
        let mut meta = BTreeMap::new();
        meta.insert("title".to_string(), JsValue::String("Dune".into()));
        meta.insert(
            "tags".to_string(),
            JsValue::Array(vec![JsValue::String("scifi".into()), JsValue::String("classic".into())]),
        );
        let context = vec![
            ("metadata".to_string(), JsValue::Object(meta)),
            ("fileClass".to_string(), JsValue::String("book".into())),
            ("utils".to_string(), utils_object()),
        ];
        run(&body, context, Arc::new(ChronoTemplating::default())).await
    }

    async fn run_str(src: &str) -> String {
        match run_src(src).await {
            Ok(v) => to_string(&v),
            Err(e) => panic!("{src}: {e}"),
        }
    }

    #[tokio::test]
    async fn literals_and_operators() {
        assert_eq!(run_str("return 1 + 2 * 3;").await, "7");
        assert_eq!(run_str("return 'a' + 1 + 2;").await, "a12");
        assert_eq!(run_str("return 7 / 2;").await, "3.5");
        assert_eq!(run_str("return 2 ** 10;").await, "1024");
        assert_eq!(run_str("return null ?? 'x';").await, "x");
        assert_eq!(run_str("return '' || 'fallback';").await, "fallback");
        assert_eq!(run_str("return 1 == '1' && 1 !== '1';").await, "true");
        assert_eq!(run_str("return typeof missing;").await, "undefined");
    }

    #[tokio::test]
    async fn context_and_templates() {
        assert_eq!(
            run_str("return `${fileClass}: ${metadata.title} [${metadata.tags.join(', ')}]`;").await,
            "book: Dune [scifi, classic]"
        );
        assert_eq!(run_str("return metadata.author?.name ?? 'unknown';").await, "unknown");
    }

    #[tokio::test]
    async fn control_flow() {
        let src = "let out = '';\n\
                   for (const t of metadata.tags) { if (t === 'classic') continue; out += t; }\n\
                   for (let i = 0; i < 3; i++) { out += i; }\n\
                   let n = 0; while (true) { n++; if (n > 4) break; }\n\
                   switch (fileClass) { case 'book': out += '!'; break; default: out += '?'; }\n\
                   return out + n;";
        assert_eq!(run_str(src).await, "scifi012!5");
    }

    #[tokio::test]
    async fn closures_and_array_methods() {
        assert_eq!(
            run_str("return metadata.tags.map(t => t.toUpperCase()).filter(t => t.length > 5).join('|');").await,
            "CLASSIC"
        );
        assert_eq!(
            run_str("function twice(x) { return x * 2; }\nreturn [1, 2, 3].reduce((a, b) => a + twice(b), 0);").await,
            "12"
        );
        assert_eq!(run_str("const xs = []; xs.push('a'); xs.push('b'); return xs.join('');").await, "ab");
        assert_eq!(run_str("let c = 0; const inc = () => { c += 1; }; inc(); inc(); return c;").await, "2");
    }

    #[tokio::test]
    async fn destructuring_and_objects() {
        assert_eq!(
            run_str("const { title, author = 'anon' } = metadata; return `${title} by ${author}`;").await,
            "Dune by anon"
        );
        assert_eq!(
            run_str("const o = { a: 1 }; o.b = 2; return Object.keys(o).join(',') + JSON.stringify(o);").await,
            "a,b{\"a\":1,\"b\":2}"
        );
    }

    #[tokio::test]
    async fn string_methods_and_regex() {
        assert_eq!(run_str("return '  Hello World '.trim().toLowerCase().replace(/o/g, '0');").await, "hell0 w0rld");
        assert_eq!(run_str("return 'a-b-c'.split('-').slice(-2).join('+');").await, "b+c");
        assert_eq!(run_str("return '7'.padStart(3, '0');").await, "007");
        assert_eq!(run_str("return 'John Smith'.replace(/(\\w+) (\\w+)/, '$2, $1');").await, "Smith, John");
        assert_eq!(run_str("return /^d/i.test('Dune') ? 'y' : 'n';").await, "y");
    }

    #[tokio::test]
    async fn repeat_rejects_unbounded_counts() {
        assert_eq!(run_str("return 'ab'.repeat(3);").await, "ababab");
        assert_eq!(run_str("return 'ab'.repeat(NaN);").await, "");
        for src in [
            "return 'a'.repeat(Infinity);",
            "return 'a'.repeat(-1);",
            "return 'abc'.repeat(1e9);",
        ] {
            let err = run_src(src).await.unwrap_err();
            assert!(err.to_string().contains("RangeError"), "{src}: {err}");
        }
        assert_eq!(
            run_str("try { 'x'.repeat(Infinity); } catch (e) { return e.name; }").await,
            "RangeError"
        );
    }

    #[tokio::test]
    async fn padding_rejects_unbounded_lengths() {
        assert_eq!(run_str("return 'ab'.padEnd(4, '-');").await, "ab--");
        assert_eq!(run_str("return 'ab'.padStart(-5);").await, "ab");
        assert_eq!(run_str("return 'ab'.padStart(Infinity, '');").await, "ab");
        for src in ["return 'a'.padStart(Infinity);", "return 'a'.padEnd(1e12, 'x');"] {
            let err = run_src(src).await.unwrap_err();
            assert!(err.to_string().contains("RangeError"), "{src}: {err}");
        }
    }

    #[tokio::test]
    async fn try_catch_and_throw() {
        assert_eq!(
            run_str("try { throw new Error('boom'); } catch (e) { return e.message; }").await,
            "boom"
        );
        assert_eq!(
            run_str("try { undefinedFn(); } catch (e) { return e.name; }").await,
            "ReferenceError"
        );
        let err = run_src("return metadata.missing.deep;").await.unwrap_err();
        assert!(err.to_string().contains("Cannot read properties of undefined"));
    }

    #[tokio::test]
    async fn utilities_are_callable() {
        assert_eq!(run_str("return utils.link('Dune');").await, "[[Dune]]");
        assert_eq!(run_str("return await utils.prompt('Author?', 'Herbert');").await, "Herbert");
        assert_eq!(run_str("return utils.now('YYYY');").await.len(), 4);
    }

    #[tokio::test]
    async fn runaway_loops_hit_the_step_limit() {
        let err = run_src("while (true) {}").await.unwrap_err();
        assert!(matches!(err, Exception::Fatal(_)));
        let err = run_src("try { while (true) {} } catch (e) { return 'caught'; }").await.unwrap_err();
        assert!(matches!(err, Exception::Fatal(_)));
    }

    #[test]
    fn yaml_conversion() {
        let v = to_yaml(&JsValue::Number(3.0));
        assert_eq!(v, serde_yaml::Value::Number(3.into()));
        let v = to_yaml(&JsValue::Array(vec![JsValue::String("a".into()), JsValue::Bool(true)]));
        assert_eq!(from_yaml(&v), JsValue::Array(vec![JsValue::String("a".into()), JsValue::Bool(true)]));
    }
}
