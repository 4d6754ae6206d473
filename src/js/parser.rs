//! Lowers the tree-sitter JavaScript syntax tree into the typed [`ast`](super::ast).
//!
//! The script source is parsed as a program, so top-level `return` and
//! `await` are accepted the way a function body would accept them. Syntax the
//! interpreter does not model (classes, modules, generators, labels) is
//! rejected here with a positioned [`SyntaxError`].

use std::sync::Arc;

use tree_sitter::{Node, Parser, Tree};

use super::ast::*;
use super::{Pos, SyntaxError};

/// Parses `src` with the JavaScript grammar without lowering it.
pub fn parse_tree(src: &str) -> Result<Tree, SyntaxError> {
    let start = Pos { line: 1, col: 1 };
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_javascript::language())
        .map_err(|e| SyntaxError::new(format!("Failed to set language: {e}"), start))?;
    parser
        .parse(src, None)
        .ok_or_else(|| SyntaxError::new("Failed to parse script", start))
}

/// Parses and lowers a function body.
pub fn parse_body(src: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let tree = parse_tree(src)?;
    let root = tree.root_node();
    let lower = Lower { src };
    if root.has_error() {
        return Err(lower.first_error(root));
    }
    lower.statements(root)
}

/// Named children that carry meaning; comments are dropped.
fn named<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| !matches!(c.kind(), "comment" | "html_comment" | "hash_bang_line"))
        .collect()
}

fn all<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    all(node).iter().any(|c| !c.is_named() && c.kind() == token)
}

fn has_optional_chain(node: Node<'_>) -> bool {
    all(node).iter().any(|c| c.kind() == "optional_chain")
}

/// Name used in "Unsupported syntax" errors for node kinds the interpreter
/// does not model.
fn unsupported_word(kind: &str) -> &str {
    match kind {
        "class_declaration" | "class" => "class",
        "import_statement" | "import" => "import",
        "export_statement" => "export",
        "with_statement" => "with",
        "debugger_statement" => "debugger",
        "labeled_statement" | "statement_identifier" => "label",
        "generator_function" | "generator_function_declaration" => "function*",
        "yield_expression" => "yield",
        "meta_property" => "new.target",
        "private_property_identifier" => "#private",
        "rest_pattern" => "rest element",
        other if other.starts_with("jsx") => "JSX",
        other => other,
    }
}

struct Lower<'s> {
    src: &'s str,
}

impl<'s> Lower<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        &self.src[node.start_byte()..node.end_byte()]
    }

    fn pos_at(&self, byte: usize) -> Pos {
        let before = &self.src[..byte];
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        Pos {
            line: before.matches('\n').count() as u32 + 1,
            col: before[line_start..].chars().count() as u32 + 1,
        }
    }

    fn err(&self, node: Node<'_>, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.pos_at(node.start_byte()))
    }

    fn unsupported(&self, node: Node<'_>) -> SyntaxError {
        self.err(
            node,
            format!("Unsupported syntax '{}'", unsupported_word(node.kind())),
        )
    }

    fn field<'t>(&self, node: Node<'t>, name: &str) -> Result<Node<'t>, SyntaxError> {
        node.child_by_field_name(name)
            .ok_or_else(|| self.err(node, format!("Malformed {}: missing {name}", node.kind())))
    }

    fn first<'t>(&self, node: Node<'t>) -> Result<Node<'t>, SyntaxError> {
        named(node)
            .into_iter()
            .next()
            .ok_or_else(|| self.err(node, format!("Malformed {}", node.kind())))
    }

    // ---- errors ----

    /// Reports the first ERROR or MISSING node, naming the token found there.
    fn first_error(&self, root: Node<'_>) -> SyntaxError {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if node.is_error() || node.is_missing() {
                return self.unexpected_at(node.start_byte());
            }
            let mut children = all(node);
            children.retain(|c| c.has_error() || c.is_missing());
            stack.extend(children.into_iter().rev());
        }
        self.unexpected_at(root.end_byte())
    }

    fn unexpected_at(&self, byte: usize) -> SyntaxError {
        let rest = &self.src[byte..];
        let token_start = byte + (rest.len() - rest.trim_start().len());
        let rest = &self.src[token_start..];
        let mut chars = rest.chars();
        let Some(c) = chars.next() else {
            return SyntaxError::new("Unexpected end of input", self.pos_at(token_start));
        };
        let token: String = if c.is_alphanumeric() || c == '_' || c == '$' {
            rest.chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect()
        } else {
            c.to_string()
        };
        SyntaxError::new(
            format!("Unexpected token '{token}'"),
            self.pos_at(token_start),
        )
    }

    // ---- statements ----

    fn statements(&self, parent: Node<'_>) -> Result<Vec<Stmt>, SyntaxError> {
        let mut out = Vec::new();
        for child in named(parent) {
            self.push_statement(child, &mut out)?;
        }
        Ok(out)
    }

    fn push_statement(&self, node: Node<'_>, out: &mut Vec<Stmt>) -> Result<(), SyntaxError> {
        if node.kind() == "return_statement" {
            let (ret, rest) = self.return_statement(node)?;
            out.push(ret);
            out.extend(rest);
        } else {
            out.push(self.statement(node)?);
        }
        Ok(())
    }

    fn statement(&self, node: Node<'_>) -> Result<Stmt, SyntaxError> {
        Ok(match node.kind() {
            "expression_statement" => Stmt::Expr(self.expr(self.first(node)?)?),
            "variable_declaration" => Stmt::Decl(DeclKind::Var, self.declarators(node, DeclKind::Var)?),
            "lexical_declaration" => {
                let kind = self.decl_kind(node)?;
                Stmt::Decl(kind, self.declarators(node, kind)?)
            }
            "function_declaration" => Stmt::Function(Arc::new(self.function(node, false)?)),
            "statement_block" => Stmt::Block(self.statements(node)?),
            "empty_statement" => Stmt::Empty,
            "if_statement" => {
                let test = self.expr(self.field(node, "condition")?)?;
                let consequent = Box::new(self.statement(self.field(node, "consequence")?)?);
                let alternate = match node.child_by_field_name("alternative") {
                    Some(clause) if clause.kind() == "else_clause" => {
                        Some(Box::new(self.statement(self.first(clause)?)?))
                    }
                    Some(stmt) => Some(Box::new(self.statement(stmt)?)),
                    None => None,
                };
                Stmt::If {
                    test,
                    consequent,
                    alternate,
                }
            }
            "return_statement" => match self.return_statement(node)? {
                (ret, None) => ret,
                (ret, Some(rest)) => Stmt::Block(vec![ret, rest]),
            },
            "switch_statement" => self.switch_statement(node)?,
            "try_statement" => self.try_statement(node)?,
            "throw_statement" => {
                let arg = self.first(node)?;
                if self.src[node.start_byte()..arg.start_byte()].contains('\n') {
                    return Err(self.err(arg, "Illegal newline after throw"));
                }
                Stmt::Throw(self.expr(arg)?)
            }
            "break_statement" | "continue_statement" => {
                if let Some(label) = node.child_by_field_name("label") {
                    return Err(self.unsupported(label));
                }
                if node.kind() == "break_statement" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                }
            }
            "for_statement" => self.for_statement(node)?,
            "for_in_statement" => self.for_each_statement(node)?,
            "while_statement" => Stmt::While {
                test: self.expr(self.field(node, "condition")?)?,
                body: Box::new(self.statement(self.field(node, "body")?)?),
            },
            "do_statement" => Stmt::DoWhile {
                body: Box::new(self.statement(self.field(node, "body")?)?),
                test: self.expr(self.field(node, "condition")?)?,
            },
            _ => return Err(self.unsupported(node)),
        })
    }

    /// `return` followed by a line break ends the statement there.
    fn return_statement(&self, node: Node<'_>) -> Result<(Stmt, Option<Stmt>), SyntaxError> {
        let Some(arg) = named(node).into_iter().next() else {
            return Ok((Stmt::Return(None), None));
        };
        let expr = self.expr(arg)?;
        if self.src[node.start_byte()..arg.start_byte()].contains('\n') {
            Ok((Stmt::Return(None), Some(Stmt::Expr(expr))))
        } else {
            Ok((Stmt::Return(Some(expr)), None))
        }
    }

    fn decl_kind(&self, node: Node<'_>) -> Result<DeclKind, SyntaxError> {
        let kind = node
            .child_by_field_name("kind")
            .or_else(|| all(node).into_iter().find(|c| !c.is_named()))
            .map(|k| k.kind());
        match kind {
            Some("var") => Ok(DeclKind::Var),
            Some("let") => Ok(DeclKind::Let),
            Some("const") => Ok(DeclKind::Const),
            _ => Err(self.err(node, "Malformed declaration")),
        }
    }

    fn declarators(&self, node: Node<'_>, kind: DeclKind) -> Result<Vec<Declarator>, SyntaxError> {
        let mut out = Vec::new();
        for decl in named(node) {
            if decl.kind() != "variable_declarator" {
                continue;
            }
            let target = self.pattern(self.field(decl, "name")?)?;
            let init = match decl.child_by_field_name("value") {
                Some(value) => Some(self.expr(value)?),
                None => None,
            };
            if init.is_none() {
                if kind == DeclKind::Const {
                    return Err(self.err(decl, "Missing initializer in const declaration"));
                }
                if !matches!(target, Pattern::Ident(_)) {
                    return Err(self.err(decl, "Missing initializer in destructuring declaration"));
                }
            }
            out.push(Declarator { target, init });
        }
        Ok(out)
    }

    fn pattern(&self, node: Node<'_>) -> Result<Pattern, SyntaxError> {
        match node.kind() {
            "identifier" => Ok(Pattern::Ident(self.text(node).to_string())),
            "object_pattern" => {
                let mut props = Vec::new();
                for prop in named(node) {
                    props.push(self.object_pattern_prop(prop)?);
                }
                Ok(Pattern::Object(props))
            }
            "array_pattern" => {
                let mut items = Vec::new();
                let mut expect_item = true;
                for child in all(node) {
                    match child.kind() {
                        "[" | "]" | "comment" => {}
                        "," => {
                            if expect_item {
                                items.push(None);
                            }
                            expect_item = true;
                        }
                        "identifier" => {
                            items.push(Some(self.text(child).to_string()));
                            expect_item = false;
                        }
                        _ => return Err(self.unsupported(child)),
                    }
                }
                Ok(Pattern::Array(items))
            }
            _ => Err(self.unsupported(node)),
        }
    }

    /// One `key: binding = default` entry of an object pattern.
    fn object_pattern_prop(
        &self,
        prop: Node<'_>,
    ) -> Result<(String, String, Option<Expr>), SyntaxError> {
        match prop.kind() {
            "shorthand_property_identifier_pattern" => {
                let name = self.text(prop).to_string();
                Ok((name.clone(), name, None))
            }
            "object_assignment_pattern" => {
                let left = self.field(prop, "left")?;
                if left.kind() != "shorthand_property_identifier_pattern" {
                    return Err(self.unsupported(left));
                }
                let name = self.text(left).to_string();
                let default = self.expr(self.field(prop, "right")?)?;
                Ok((name.clone(), name, Some(default)))
            }
            "pair_pattern" => {
                let key = match self.prop_key(self.field(prop, "key")?)? {
                    PropKey::Named(key) => key,
                    PropKey::Computed(_) => return Err(self.unsupported(prop)),
                };
                let value = self.field(prop, "value")?;
                match value.kind() {
                    "identifier" => Ok((key, self.text(value).to_string(), None)),
                    "assignment_pattern" => {
                        let left = self.field(value, "left")?;
                        if left.kind() != "identifier" {
                            return Err(self.unsupported(left));
                        }
                        let default = self.expr(self.field(value, "right")?)?;
                        Ok((key, self.text(left).to_string(), Some(default)))
                    }
                    _ => Err(self.unsupported(value)),
                }
            }
            _ => Err(self.unsupported(prop)),
        }
    }

    fn switch_statement(&self, node: Node<'_>) -> Result<Stmt, SyntaxError> {
        let discriminant = self.expr(self.field(node, "value")?)?;
        let mut cases = Vec::new();
        let mut seen_default = false;
        for case in named(self.field(node, "body")?) {
            let test = match case.kind() {
                "switch_case" => {
                    let value = self.field(case, "value")?;
                    let mut consequent = Vec::new();
                    for stmt in named(case) {
                        if stmt.id() != value.id() {
                            self.push_statement(stmt, &mut consequent)?;
                        }
                    }
                    cases.push(SwitchCase {
                        test: Some(self.expr(value)?),
                        consequent,
                    });
                    continue;
                }
                "switch_default" => {
                    if seen_default {
                        return Err(
                            self.err(case, "More than one default clause in switch statement")
                        );
                    }
                    seen_default = true;
                    None
                }
                _ => return Err(self.unsupported(case)),
            };
            cases.push(SwitchCase {
                test,
                consequent: self.statements(case)?,
            });
        }
        Ok(Stmt::Switch {
            discriminant,
            cases,
        })
    }

    fn try_statement(&self, node: Node<'_>) -> Result<Stmt, SyntaxError> {
        let block = self.statements(self.field(node, "body")?)?;
        let handler = match node.child_by_field_name("handler") {
            Some(clause) => {
                let param = match clause.child_by_field_name("parameter") {
                    Some(p) if p.kind() == "identifier" => Some(self.text(p).to_string()),
                    Some(p) => return Err(self.unsupported(p)),
                    None => None,
                };
                Some(CatchClause {
                    param,
                    body: self.statements(self.field(clause, "body")?)?,
                })
            }
            None => None,
        };
        let finalizer = match node.child_by_field_name("finalizer") {
            Some(clause) => Some(self.statements(self.field(clause, "body")?)?),
            None => None,
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.err(node, "Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            handler,
            finalizer,
        })
    }

    fn for_statement(&self, node: Node<'_>) -> Result<Stmt, SyntaxError> {
        let init = match node.child_by_field_name("initializer") {
            Some(decl) if decl.kind() == "variable_declaration" => {
                Some(ForInit::Decl(DeclKind::Var, self.declarators(decl, DeclKind::Var)?))
            }
            Some(decl) if decl.kind() == "lexical_declaration" => {
                let kind = self.decl_kind(decl)?;
                Some(ForInit::Decl(kind, self.declarators(decl, kind)?))
            }
            other => self.for_clause(other)?.map(ForInit::Expr),
        };
        Ok(Stmt::For {
            init,
            test: self.for_clause(node.child_by_field_name("condition"))?,
            update: self.for_clause(node.child_by_field_name("increment"))?,
            body: Box::new(self.statement(self.field(node, "body")?)?),
        })
    }

    fn for_clause(&self, node: Option<Node<'_>>) -> Result<Option<Expr>, SyntaxError> {
        match node {
            None => Ok(None),
            Some(n) if n.kind() == "empty_statement" || !n.is_named() => Ok(None),
            Some(n) if n.kind() == "expression_statement" => Ok(Some(self.expr(self.first(n)?)?)),
            Some(n) => Ok(Some(self.expr(n)?)),
        }
    }

    fn for_each_statement(&self, node: Node<'_>) -> Result<Stmt, SyntaxError> {
        if has_token(node, "await") {
            return Err(self.err(node, "Unsupported syntax 'for await'"));
        }
        let kind = match node.child_by_field_name("kind").map(|k| k.kind()) {
            Some("var") => DeclKind::Var,
            Some("let") => DeclKind::Let,
            Some("const") => DeclKind::Const,
            _ => {
                return Err(self.err(
                    node,
                    "Unsupported syntax: for-in/of loops must declare their variable",
                ));
            }
        };
        Ok(Stmt::ForEach {
            kind,
            target: self.pattern(self.field(node, "left")?)?,
            iterable: self.expr(self.field(node, "right")?)?,
            keys: has_token(node, "in"),
            body: Box::new(self.statement(self.field(node, "body")?)?),
        })
    }

    // ---- functions ----

    fn function(&self, node: Node<'_>, is_arrow: bool) -> Result<Function, SyntaxError> {
        if has_token(node, "*") {
            return Err(self.err(node, "Unsupported syntax 'function*'"));
        }
        let params = if let Some(single) = node.child_by_field_name("parameter") {
            vec![Param {
                name: self.text(single).to_string(),
                default: None,
                rest: false,
            }]
        } else if let Some(list) = node.child_by_field_name("parameters") {
            self.params(list)?
        } else {
            Vec::new()
        };
        let body = self.field(node, "body")?;
        let body = if body.kind() == "statement_block" {
            FunctionBody::Block(self.statements(body)?)
        } else {
            FunctionBody::Expr(Box::new(self.expr(body)?))
        };
        Ok(Function {
            name: node
                .child_by_field_name("name")
                .map(|n| self.text(n).to_string()),
            params,
            body,
            is_arrow,
            is_async: has_token(node, "async"),
        })
    }

    fn params(&self, list: Node<'_>) -> Result<Vec<Param>, SyntaxError> {
        let mut out = Vec::new();
        for param in named(list) {
            let (name, default, rest) = match param.kind() {
                "identifier" => (param, None, false),
                "assignment_pattern" => (
                    self.field(param, "left")?,
                    Some(self.expr(self.field(param, "right")?)?),
                    false,
                ),
                "rest_pattern" => (self.first(param)?, None, true),
                _ => return Err(self.err(param, "Unsupported syntax: destructured parameter")),
            };
            if name.kind() != "identifier" {
                return Err(self.err(name, "Unsupported syntax: destructured parameter"));
            }
            out.push(Param {
                name: self.text(name).to_string(),
                default,
                rest,
            });
        }
        Ok(out)
    }

    // ---- expressions ----

    fn boxed(&self, node: Node<'_>) -> Result<Box<Expr>, SyntaxError> {
        Ok(Box::new(self.expr(node)?))
    }

    fn expr(&self, node: Node<'_>) -> Result<Expr, SyntaxError> {
        Ok(match node.kind() {
            "parenthesized_expression" => self.expr(self.first(node)?)?,
            "sequence_expression" => {
                let mut items = Vec::new();
                self.flatten_sequence(node, &mut items)?;
                Expr::Sequence(items)
            }
            "identifier" | "undefined" => Expr::Ident(self.text(node).to_string()),
            "this" => Expr::This,
            "true" => Expr::Bool(true),
            "false" => Expr::Bool(false),
            "null" => Expr::Null,
            "number" => Expr::Number(self.number(node)?),
            "string" => Expr::Str(self.string(node)?),
            "template_string" => Expr::Template(self.template(node)?),
            "regex" => Expr::Regex {
                pattern: self.text(self.field(node, "pattern")?).to_string(),
                flags: node
                    .child_by_field_name("flags")
                    .map(|f| self.text(f).to_string())
                    .unwrap_or_default(),
            },
            "array" => self.array(node)?,
            "object" => self.object(node)?,
            "function" | "function_expression" => Expr::Function(Arc::new(self.function(node, false)?)),
            "arrow_function" => Expr::Function(Arc::new(self.function(node, true)?)),
            "member_expression" => {
                let property = self.field(node, "property")?;
                if property.kind() == "private_property_identifier" {
                    return Err(self.unsupported(property));
                }
                Expr::Member {
                    object: self.boxed(self.field(node, "object")?)?,
                    property: MemberProp::Name(self.text(property).to_string()),
                    optional: has_optional_chain(node),
                }
            }
            "subscript_expression" => Expr::Member {
                object: self.boxed(self.field(node, "object")?)?,
                property: MemberProp::Computed(self.boxed(self.field(node, "index")?)?),
                optional: has_optional_chain(node),
            },
            "call_expression" => {
                let args = self.field(node, "arguments")?;
                if args.kind() == "template_string" {
                    return Err(self.err(node, "Unsupported syntax: tagged template"));
                }
                let callee = self.field(node, "function")?;
                if matches!(callee.kind(), "import" | "super") {
                    return Err(self.unsupported(callee));
                }
                Expr::Call {
                    callee: self.boxed(callee)?,
                    args: self.arguments(args)?,
                    optional: has_optional_chain(node),
                }
            }
            "new_expression" => Expr::New {
                callee: self.boxed(self.field(node, "constructor")?)?,
                args: match node.child_by_field_name("arguments") {
                    Some(args) => self.arguments(args)?,
                    None => Vec::new(),
                },
            },
            "await_expression" => Expr::Await(self.boxed(self.first(node)?)?),
            "spread_element" => Expr::Spread(self.boxed(self.first(node)?)?),
            "unary_expression" => {
                let op = match self.field(node, "operator")?.kind() {
                    "!" => UnaryOp::Not,
                    "-" => UnaryOp::Neg,
                    "+" => UnaryOp::Plus,
                    "~" => UnaryOp::BitNot,
                    "typeof" => UnaryOp::TypeOf,
                    "void" => UnaryOp::Void,
                    "delete" => UnaryOp::Delete,
                    other => return Err(self.err(node, format!("Unexpected token '{other}'"))),
                };
                Expr::Unary {
                    op,
                    arg: self.boxed(self.field(node, "argument")?)?,
                }
            }
            "update_expression" => {
                let operator = self.field(node, "operator")?;
                let argument = self.field(node, "argument")?;
                let target = self.expr(argument)?;
                if !matches!(target, Expr::Ident(_) | Expr::Member { .. }) {
                    return Err(self.err(
                        argument,
                        "Invalid left-hand side expression in update operation",
                    ));
                }
                Expr::Update {
                    increment: operator.kind() == "++",
                    prefix: operator.start_byte() < argument.start_byte(),
                    target: Box::new(target),
                }
            }
            "binary_expression" => self.binary(node)?,
            "ternary_expression" => Expr::Conditional {
                test: self.boxed(self.field(node, "condition")?)?,
                consequent: self.boxed(self.field(node, "consequence")?)?,
                alternate: self.boxed(self.field(node, "alternative")?)?,
            },
            "assignment_expression" => self.assignment(node, AssignOp::Assign)?,
            "augmented_assignment_expression" => {
                let op = match self.field(node, "operator")?.kind() {
                    "+=" => AssignOp::Add,
                    "-=" => AssignOp::Sub,
                    "*=" => AssignOp::Mul,
                    "/=" => AssignOp::Div,
                    "%=" => AssignOp::Rem,
                    "&&=" => AssignOp::And,
                    "||=" => AssignOp::Or,
                    "??=" => AssignOp::Nullish,
                    other => return Err(self.err(node, format!("Unsupported syntax '{other}'"))),
                };
                self.assignment(node, op)?
            }
            _ => return Err(self.unsupported(node)),
        })
    }

    fn flatten_sequence(&self, node: Node<'_>, out: &mut Vec<Expr>) -> Result<(), SyntaxError> {
        for child in named(node) {
            if child.kind() == "sequence_expression" {
                self.flatten_sequence(child, out)?;
            } else {
                out.push(self.expr(child)?);
            }
        }
        Ok(())
    }

    fn assignment(&self, node: Node<'_>, op: AssignOp) -> Result<Expr, SyntaxError> {
        let left = self.field(node, "left")?;
        if matches!(left.kind(), "object_pattern" | "array_pattern") {
            return Err(self.err(left, "Unsupported syntax: destructuring assignment"));
        }
        let target = self.expr(left)?;
        if !matches!(target, Expr::Ident(_) | Expr::Member { .. }) {
            return Err(self.err(left, "Invalid left-hand side in assignment"));
        }
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: self.boxed(self.field(node, "right")?)?,
        })
    }

    fn binary(&self, node: Node<'_>) -> Result<Expr, SyntaxError> {
        let operator = self.field(node, "operator")?;
        let left = self.boxed(self.field(node, "left")?)?;
        let right = self.boxed(self.field(node, "right")?)?;
        let logical = match operator.kind() {
            "&&" => Some(LogicalOp::And),
            "||" => Some(LogicalOp::Or),
            "??" => Some(LogicalOp::Nullish),
            _ => None,
        };
        if let Some(op) = logical {
            return Ok(Expr::Logical { op, left, right });
        }
        let op = match operator.kind() {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "**" => BinaryOp::Exp,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::NotEq,
            "===" => BinaryOp::StrictEq,
            "!==" => BinaryOp::StrictNotEq,
            "<" => BinaryOp::Lt,
            ">" => BinaryOp::Gt,
            "<=" => BinaryOp::LtEq,
            ">=" => BinaryOp::GtEq,
            "&" => BinaryOp::BitAnd,
            "|" => BinaryOp::BitOr,
            "^" => BinaryOp::BitXor,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            ">>>" => BinaryOp::UShr,
            "in" => BinaryOp::In,
            "instanceof" => BinaryOp::InstanceOf,
            other => return Err(self.err(operator, format!("Unexpected token '{other}'"))),
        };
        Ok(Expr::Binary { op, left, right })
    }

    fn arguments(&self, node: Node<'_>) -> Result<Vec<Expr>, SyntaxError> {
        named(node).into_iter().map(|arg| self.expr(arg)).collect()
    }

    /// Array literal; holes read as `undefined`.
    fn array(&self, node: Node<'_>) -> Result<Expr, SyntaxError> {
        let mut items = Vec::new();
        let mut expect_item = true;
        for child in all(node) {
            match child.kind() {
                "[" | "]" | "comment" => {}
                "," => {
                    if expect_item {
                        items.push(Expr::Ident("undefined".into()));
                    }
                    expect_item = true;
                }
                _ => {
                    items.push(self.expr(child)?);
                    expect_item = false;
                }
            }
        }
        Ok(Expr::Array(items))
    }

    fn object(&self, node: Node<'_>) -> Result<Expr, SyntaxError> {
        let mut props = Vec::new();
        for prop in named(node) {
            props.push(match prop.kind() {
                "pair" => ObjectProp::KeyValue(
                    self.prop_key(self.field(prop, "key")?)?,
                    self.expr(self.field(prop, "value")?)?,
                ),
                "shorthand_property_identifier" => {
                    let name = self.text(prop).to_string();
                    ObjectProp::KeyValue(PropKey::Named(name.clone()), Expr::Ident(name))
                }
                "spread_element" => ObjectProp::Spread(self.expr(self.first(prop)?)?),
                "method_definition" => {
                    if has_token(prop, "get") || has_token(prop, "set") || has_token(prop, "static")
                    {
                        return Err(self.err(prop, "Unsupported syntax: accessor"));
                    }
                    let key = self.prop_key(self.field(prop, "name")?)?;
                    let mut method = self.function(prop, false)?;
                    if let PropKey::Named(name) = &key {
                        method.name = Some(name.clone());
                    }
                    ObjectProp::KeyValue(key, Expr::Function(Arc::new(method)))
                }
                _ => return Err(self.unsupported(prop)),
            });
        }
        Ok(Expr::Object(props))
    }

    fn prop_key(&self, key: Node<'_>) -> Result<PropKey, SyntaxError> {
        Ok(match key.kind() {
            "property_identifier" | "identifier" => PropKey::Named(self.text(key).to_string()),
            "string" => PropKey::Named(self.string(key)?),
            "number" => PropKey::Named(number_key(self.number(key)?)),
            "computed_property_name" => PropKey::Computed(self.expr(self.first(key)?)?),
            _ => return Err(self.unsupported(key)),
        })
    }

    // ---- literals ----

    fn number(&self, node: Node<'_>) -> Result<f64, SyntaxError> {
        parse_number(self.text(node)).ok_or_else(|| self.err(node, "Invalid number"))
    }

    fn string(&self, node: Node<'_>) -> Result<String, SyntaxError> {
        let raw = self.text(node);
        let inner = raw.get(1..raw.len().saturating_sub(1)).unwrap_or_default();
        unescape(inner).map_err(|message| self.err(node, message))
    }

    fn template(&self, node: Node<'_>) -> Result<Vec<TemplatePart>, SyntaxError> {
        let mut parts = Vec::new();
        let mut at = node.start_byte() + 1;
        let end = node.end_byte().saturating_sub(1).max(at);
        let push_str = |parts: &mut Vec<TemplatePart>, raw: &str| -> Result<(), SyntaxError> {
            if !raw.is_empty() {
                let text = unescape(raw).map_err(|message| self.err(node, message))?;
                parts.push(TemplatePart::Str(text));
            }
            Ok(())
        };
        for child in named(node) {
            if child.kind() != "template_substitution" {
                continue;
            }
            push_str(&mut parts, &self.src[at..child.start_byte()])?;
            parts.push(TemplatePart::Expr(self.expr(self.first(child)?)?));
            at = child.end_byte();
        }
        push_str(&mut parts, &self.src[at..end])?;
        Ok(parts)
    }
}

fn parse_number(text: &str) -> Option<f64> {
    if text.ends_with('n') {
        return None;
    }
    let digits: String = text.chars().filter(|c| *c != '_').collect();
    let lower = digits.to_ascii_lowercase();
    let radix = match lower.get(..2) {
        Some("0x") => Some(16),
        Some("0o") => Some(8),
        Some("0b") => Some(2),
        _ => None,
    };
    match radix {
        Some(radix) => u64::from_str_radix(&lower[2..], radix).ok().map(|n| n as f64),
        None => lower.parse::<f64>().ok(),
    }
}

/// Decodes the escape sequences of a string or template chunk.
fn unescape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(e) = chars.next() else {
            return Err("Invalid or unexpected token".into());
        };
        match e {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            '\n' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                let c = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or("Invalid hexadecimal escape sequence")?;
                out.push(c);
            }
            'u' => {
                let hex: String = if chars.peek() == Some(&'{') {
                    chars.next();
                    chars.by_ref().take_while(|c| *c != '}').collect()
                } else {
                    chars.by_ref().take(4).collect()
                };
                let c = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or("Invalid Unicode escape sequence")?;
                out.push(c);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::parse_function_body;

    fn expr(src: &str) -> Expr {
        match parse_function_body(src).unwrap().as_slice() {
            [Stmt::Expr(e)] => e.clone(),
            other => panic!("expected one expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_and_associativity() {
        let Expr::Binary { op, right, .. } = expr("1 + 2 * 3") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));

        let Expr::Binary { op, right, .. } = expr("2 ** 3 ** 2") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Exp);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::Exp, .. }));

        assert!(matches!(expr("a ?? b"), Expr::Logical { op: LogicalOp::Nullish, .. }));
    }

    #[test]
    fn arrow_functions() {
        assert!(matches!(expr("x => x + 1"), Expr::Function(f) if f.is_arrow && f.params.len() == 1));
        assert!(matches!(expr("(a, b = 2) => { return a; }"), Expr::Function(f) if f.params.len() == 2));
        assert!(matches!(expr("async () => 1"), Expr::Function(f) if f.is_async));
        assert!(matches!(expr("(...rest) => rest"), Expr::Function(f) if f.params[0].rest));
        assert!(matches!(expr("(a + b)"), Expr::Binary { .. }));
    }

    #[test]
    fn optional_chaining_and_calls() {
        let e = expr("metadata?.tags?.join(', ')");
        let Expr::Call { callee, .. } = e else {
            panic!("expected call");
        };
        assert!(matches!(*callee, Expr::Member { optional: true, .. }));
        assert!(matches!(expr("fn?.(1)"), Expr::Call { optional: true, .. }));
        assert!(matches!(
            expr("a[0]"),
            Expr::Member { property: MemberProp::Computed(_), optional: false, .. }
        ));
    }

    #[test]
    fn template_literals_parse_substitutions() {
        let Expr::Template(parts) = expr("`${file.name} - ${1 + 2}`") else {
            panic!("expected template");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], TemplatePart::Expr(Expr::Member { .. })));
        assert_eq!(parts[1], TemplatePart::Str(" - ".into()));
    }

    #[test]
    fn literals_decode() {
        assert_eq!(expr(r"'a\nA\x42'"), Expr::Str("a\nAB".into()));
        assert_eq!(expr("0x1F"), Expr::Number(31.0));
        assert_eq!(expr("1_000"), Expr::Number(1000.0));
        assert_eq!(expr("[1, , 2]"), Expr::Array(vec![
            Expr::Number(1.0),
            Expr::Ident("undefined".into()),
            Expr::Number(2.0),
        ]));
        assert!(matches!(expr("/a+/gi"), Expr::Regex { flags, .. } if flags == "gi"));
    }

    #[test]
    fn asi_on_newlines() {
        let body = parse_function_body("const a = 1\nconst b = a\nreturn b").unwrap();
        assert_eq!(body.len(), 3);
        let body = parse_function_body("return\n'x'").unwrap();
        assert_eq!(body[0], Stmt::Return(None));
    }

    #[test]
    fn statements() {
        let body = parse_function_body(
            "let out = '';\n\
             for (const t of tags) { if (t) continue; }\n\
             for (let i = 0; i < 3; i++) out += i;\n\
             switch (x) { case 1: case 2: return 'a'; default: return 'b'; }\n\
             try { await utils.prompt('x') } catch (e) { return '' } finally { }\n\
             const { title, author: who = 'anon' } = metadata;",
        )
        .unwrap();
        assert_eq!(body.len(), 6);
        assert!(matches!(body[1], Stmt::ForEach { keys: false, .. }));
        assert!(matches!(&body[2], Stmt::For { init: Some(_), test: Some(_), update: Some(_), .. }));
        assert!(matches!(&body[3], Stmt::Switch { cases, .. } if cases.len() == 3));
        let Stmt::Decl(DeclKind::Const, decls) = &body[5] else {
            panic!("expected const");
        };
        assert!(matches!(
            &decls[0].target,
            Pattern::Object(props) if props[1].0 == "author" && props[1].1 == "who" && props[1].2.is_some()
        ));
    }

    #[test]
    fn comments_are_ignored() {
        let body = parse_function_body("// lead\nconst a = 1; /* mid */ return a; // tail").unwrap();
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn object_literals() {
        let Expr::Object(props) = expr("({ a, 'b': 1, [k]: 2, ...rest, m() { return 1; } })") else {
            panic!("expected object");
        };
        assert_eq!(props.len(), 5);
        assert!(matches!(&props[4], ObjectProp::KeyValue(PropKey::Named(m), Expr::Function(_)) if m == "m"));
    }

    #[test]
    fn syntax_errors() {
        for src in [
            "return (",
            "if (x { return 1; }",
            "const a;",
            "let = ;",
            "return 'a' 'b'",
            "try { }",
            "switch (x) { default: default: }",
            "1 = 2",
            "class A {}",
            "function* g() {}",
            "outer: for (;;) { break outer; }",
        ] {
            assert!(parse_function_body(src).is_err(), "{src} should fail");
        }
    }

    #[test]
    fn unsupported_syntax_is_named() {
        let err = parse_function_body("class A {}").unwrap_err();
        assert_eq!(err.message, "Unsupported syntax 'class'");
        let err = parse_function_body("const a;").unwrap_err();
        assert_eq!(err.message, "Missing initializer in const declaration");
    }

    #[test]
    fn error_positions() {
        let err = parse_function_body("const a = 1;\nreturn a +;").unwrap_err();
        assert_eq!(err.pos.line, 2);
        assert!(err.message.starts_with("Unexpected"), "{}", err.message);

        let err = parse_function_body("let x = 1;\n  const y;").unwrap_err();
        assert_eq!((err.pos.line, err.pos.col), (2, 9));
    }
}
