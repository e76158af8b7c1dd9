//! Raw string query surface.
//!
//! Supported shape:
//!
//! ```text
//! declare function project(d) {
//!     include(d.EventId);
//!     var members = counter(d.EventId, "Members");
//!     return { UserId: d.UserId, Members: members }
//! }
//! from index "Membership/ByEventAndUserId" as d
//! where UserId = "User/Ayende"
//! select project(d)
//! include timings()
//! ```
//!
//! `include(expr)` registers the referenced document (and its counters) in
//! the session cache; `counter(doc, name)` reads a counter during evaluation.
//! Everything runs inside the single round trip the query costs.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use std::collections::HashMap;
use std::time::Instant;

use crate::session::DocumentSession;
use crate::storage_error::StorageError;
use crate::store::DocumentStore;

#[derive(Clone, Debug, PartialEq)]
pub struct QueryTimings {
    pub duration_micros: u64,
}

#[derive(Debug)]
pub struct RawQueryResult<R> {
    pub results: Vec<R>,
    pub timings: Option<QueryTimings>,
}

impl<R> RawQueryResult<R> {
    pub fn into_first(self) -> Option<R> {
        self.results.into_iter().next()
    }

    pub fn first(&self) -> Option<&R> {
        self.results.first()
    }
}

pub(crate) async fn execute<R: DeserializeOwned>(
    session: &mut DocumentSession,
    text: &str,
) -> Result<RawQueryResult<R>, StorageError> {
    let started = Instant::now();
    let query = parse(text)?;
    session.bump_request()?;
    let store = session.store_handle();

    let filter = query
        .where_clause
        .as_ref()
        .map(|(field, value)| (field.as_str(), value));
    let entries = store.query_index(&query.index, filter).await?;

    let mut includes: Vec<String> = Vec::new();
    let mut raw_results = Vec::with_capacity(entries.len());
    for entry in entries {
        let projected = match &query.select {
            Some(expr) => {
                let mut env = HashMap::new();
                if let Some(alias) = &query.alias {
                    env.insert(alias.clone(), entry.clone());
                }
                eval_expr(expr, &env, &query, &store, &mut includes)?
            }
            None => entry,
        };
        raw_results.push(projected);
    }
    for id in &includes {
        session.ingest_include(id).await?;
    }
    debug!(
        index = %query.index,
        results = raw_results.len(),
        includes = includes.len(),
        "raw query executed"
    );

    let results = raw_results
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Into::into))
        .collect::<Result<Vec<R>, StorageError>>()?;
    let timings = query.timings.then(|| QueryTimings {
        duration_micros: started.elapsed().as_micros() as u64,
    });
    Ok(RawQueryResult { results, timings })
}

// ---------------- AST ----------------

#[derive(Debug)]
struct RawQuery {
    functions: Vec<FunctionDecl>,
    index: String,
    alias: Option<String>,
    where_clause: Option<(String, Value)>,
    select: Option<Expr>,
    timings: bool,
}

#[derive(Debug)]
struct FunctionDecl {
    name: String,
    params: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Debug)]
enum Stmt {
    Include(Expr),
    Var(String, Expr),
    Return(Expr),
}

#[derive(Debug)]
enum Expr {
    /// Dotted path rooted at a parameter or `var` binding.
    Path(Vec<String>),
    Str(String),
    Num(Value),
    Object(Vec<(String, Expr)>),
    Counter(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ---------------- evaluation ----------------

fn eval_expr(
    expr: &Expr,
    env: &HashMap<String, Value>,
    query: &RawQuery,
    store: &DocumentStore,
    includes: &mut Vec<String>,
) -> Result<Value, StorageError> {
    match expr {
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Num(n) => Ok(n.clone()),
        Expr::Path(parts) => {
            let root = env.get(&parts[0]).ok_or_else(|| {
                StorageError::InvalidQuery(format!("unknown identifier '{}'", parts[0]))
            })?;
            let mut value = root;
            for part in &parts[1..] {
                value = value.get(part).unwrap_or(&Value::Null);
            }
            Ok(value.clone())
        }
        Expr::Object(fields) => {
            let mut obj = Map::new();
            for (key, value_expr) in fields {
                obj.insert(
                    key.clone(),
                    eval_expr(value_expr, env, query, store, includes)?,
                );
            }
            Ok(Value::Object(obj))
        }
        Expr::Counter(doc_expr, name_expr) => {
            let doc = eval_expr(doc_expr, env, query, store, includes)?;
            let name = eval_expr(name_expr, env, query, store, includes)?;
            let (Value::String(doc_id), Value::String(name)) = (doc, name) else {
                return Err(StorageError::InvalidQuery(
                    "counter() expects a document id and a counter name".into(),
                ));
            };
            Ok(match store.read_counter(&doc_id, &name)? {
                Some(v) => Value::from(v),
                None => Value::Null,
            })
        }
        Expr::Call(name, args) => {
            let decl = query
                .functions
                .iter()
                .find(|f| &f.name == name)
                .ok_or_else(|| {
                    StorageError::InvalidQuery(format!("unknown function '{}'", name))
                })?;
            if decl.params.len() != args.len() {
                return Err(StorageError::InvalidQuery(format!(
                    "function '{}' takes {} argument(s)",
                    name,
                    decl.params.len()
                )));
            }
            let mut call_env = HashMap::new();
            for (param, arg) in decl.params.iter().zip(args) {
                call_env.insert(
                    param.clone(),
                    eval_expr(arg, env, query, store, includes)?,
                );
            }
            apply_function(decl, call_env, query, store, includes)
        }
    }
}

fn apply_function(
    decl: &FunctionDecl,
    mut env: HashMap<String, Value>,
    query: &RawQuery,
    store: &DocumentStore,
    includes: &mut Vec<String>,
) -> Result<Value, StorageError> {
    for stmt in &decl.body {
        match stmt {
            Stmt::Include(expr) => {
                let id = eval_expr(expr, &env, query, store, includes)?;
                if let Value::String(id) = id {
                    includes.push(id);
                }
            }
            Stmt::Var(name, expr) => {
                let value = eval_expr(expr, &env, query, store, includes)?;
                env.insert(name.clone(), value);
            }
            Stmt::Return(expr) => return eval_expr(expr, &env, query, store, includes),
        }
    }
    Ok(Value::Null)
}

// ---------------- lexer ----------------

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(Value),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Semi,
    Colon,
    Dot,
    Eq,
}

fn lex(text: &str) -> Result<Vec<Tok>, StorageError> {
    let mut toks = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] as char != '"' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(StorageError::InvalidQuery("unterminated string".into()));
                }
                toks.push(Tok::Str(text[start..j].to_string()));
                i = j + 1;
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] as char == '.')
                {
                    i += 1;
                }
                let raw = &text[start..i];
                let num = if raw.contains('.') {
                    raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64).map(Value::Number)
                } else {
                    raw.parse::<i64>().ok().map(Value::from)
                };
                toks.push(Tok::Num(num.ok_or_else(|| {
                    StorageError::InvalidQuery(format!("bad number '{}'", raw))
                })?));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '@' => {
                let start = i;
                i += 1;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '@' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(text[start..i].to_string()));
            }
            other => {
                return Err(StorageError::InvalidQuery(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }
    Ok(toks)
}

// ---------------- parser ----------------

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Result<Tok, StorageError> {
        let tok = self
            .toks
            .get(self.pos)
            .cloned()
            .ok_or_else(|| StorageError::InvalidQuery("unexpected end of query".into()))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, tok: Tok) -> Result<(), StorageError> {
        let got = self.next()?;
        if got != tok {
            return Err(StorageError::InvalidQuery(format!(
                "expected {:?}, got {:?}",
                tok, got
            )));
        }
        Ok(())
    }

    fn ident(&mut self) -> Result<String, StorageError> {
        match self.next()? {
            Tok::Ident(s) => Ok(s),
            other => Err(StorageError::InvalidQuery(format!(
                "expected identifier, got {:?}",
                other
            ))),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), StorageError> {
        if self.at_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(StorageError::InvalidQuery(format!(
                "expected '{}', got {:?}",
                kw,
                self.peek()
            )))
        }
    }
}

fn parse(text: &str) -> Result<RawQuery, StorageError> {
    let mut p = Parser {
        toks: lex(text)?,
        pos: 0,
    };

    let mut functions = Vec::new();
    while p.at_keyword("declare") {
        functions.push(parse_function(&mut p)?);
    }

    p.expect_keyword("from")?;
    p.expect_keyword("index")?;
    let index = match p.next()? {
        Tok::Str(s) => s,
        other => {
            return Err(StorageError::InvalidQuery(format!(
                "expected index name string, got {:?}",
                other
            )));
        }
    };
    let alias = if p.at_keyword("as") {
        p.pos += 1;
        Some(p.ident()?)
    } else {
        None
    };

    let where_clause = if p.at_keyword("where") {
        p.pos += 1;
        let field = p.ident()?;
        p.expect(Tok::Eq)?;
        let value = match p.next()? {
            Tok::Str(s) => Value::String(s),
            Tok::Num(n) => n,
            other => {
                return Err(StorageError::InvalidQuery(format!(
                    "expected literal after '=', got {:?}",
                    other
                )));
            }
        };
        Some((field, value))
    } else {
        None
    };

    let select = if p.at_keyword("select") {
        p.pos += 1;
        Some(parse_expr(&mut p)?)
    } else {
        None
    };

    let timings = if p.at_keyword("include") {
        p.pos += 1;
        p.expect_keyword("timings")?;
        p.expect(Tok::LParen)?;
        p.expect(Tok::RParen)?;
        true
    } else {
        false
    };

    if let Some(tok) = p.peek() {
        return Err(StorageError::InvalidQuery(format!(
            "trailing input at {:?}",
            tok
        )));
    }

    Ok(RawQuery {
        functions,
        index,
        alias,
        where_clause,
        select,
        timings,
    })
}

fn parse_function(p: &mut Parser) -> Result<FunctionDecl, StorageError> {
    p.expect_keyword("declare")?;
    p.expect_keyword("function")?;
    let name = p.ident()?;
    p.expect(Tok::LParen)?;
    let mut params = Vec::new();
    if p.peek() != Some(&Tok::RParen) {
        loop {
            params.push(p.ident()?);
            if p.peek() == Some(&Tok::Comma) {
                p.pos += 1;
            } else {
                break;
            }
        }
    }
    p.expect(Tok::RParen)?;
    p.expect(Tok::LBrace)?;

    let mut body = Vec::new();
    loop {
        if p.peek() == Some(&Tok::RBrace) {
            p.pos += 1;
            break;
        }
        if p.at_keyword("include") {
            p.pos += 1;
            p.expect(Tok::LParen)?;
            let expr = parse_expr(p)?;
            p.expect(Tok::RParen)?;
            p.expect(Tok::Semi)?;
            body.push(Stmt::Include(expr));
        } else if p.at_keyword("var") {
            p.pos += 1;
            let name = p.ident()?;
            p.expect(Tok::Eq)?;
            let expr = parse_expr(p)?;
            p.expect(Tok::Semi)?;
            body.push(Stmt::Var(name, expr));
        } else if p.at_keyword("return") {
            p.pos += 1;
            let expr = parse_expr(p)?;
            if p.peek() == Some(&Tok::Semi) {
                p.pos += 1;
            }
            body.push(Stmt::Return(expr));
        } else {
            return Err(StorageError::InvalidQuery(format!(
                "unexpected statement at {:?}",
                p.peek()
            )));
        }
    }

    Ok(FunctionDecl { name, params, body })
}

fn parse_expr(p: &mut Parser) -> Result<Expr, StorageError> {
    match p.next()? {
        Tok::Str(s) => Ok(Expr::Str(s)),
        Tok::Num(n) => Ok(Expr::Num(n)),
        Tok::LBrace => {
            let mut fields = Vec::new();
            if p.peek() != Some(&Tok::RBrace) {
                loop {
                    let key = p.ident()?;
                    p.expect(Tok::Colon)?;
                    fields.push((key, parse_expr(p)?));
                    if p.peek() == Some(&Tok::Comma) {
                        p.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            p.expect(Tok::RBrace)?;
            Ok(Expr::Object(fields))
        }
        Tok::Ident(name) => {
            if p.peek() == Some(&Tok::LParen) {
                p.pos += 1;
                let mut args = Vec::new();
                if p.peek() != Some(&Tok::RParen) {
                    loop {
                        args.push(parse_expr(p)?);
                        if p.peek() == Some(&Tok::Comma) {
                            p.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                p.expect(Tok::RParen)?;
                if name == "counter" {
                    if args.len() != 2 {
                        return Err(StorageError::InvalidQuery(
                            "counter() takes exactly two arguments".into(),
                        ));
                    }
                    let mut it = args.into_iter();
                    let doc = it.next().unwrap_or(Expr::Str(String::new()));
                    let cname = it.next().unwrap_or(Expr::Str(String::new()));
                    Ok(Expr::Counter(Box::new(doc), Box::new(cname)))
                } else {
                    Ok(Expr::Call(name, args))
                }
            } else {
                let mut parts = vec![name];
                while p.peek() == Some(&Tok::Dot) {
                    p.pos += 1;
                    parts.push(p.ident()?);
                }
                Ok(Expr::Path(parts))
            }
        }
        other => Err(StorageError::InvalidQuery(format!(
            "unexpected token {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        declare function includeRelatedCounters(d) {
            include(d.EventId);
            var numberOfMembers = counter(d.EventId, "Members");
            return { UserId: d.UserId, Members: numberOfMembers }
        }

        from index "Membership/ByEventAndUserId" as d
        where UserId = "User/Ayende"
        select includeRelatedCounters(d)
        include timings()
    "#;

    #[test]
    fn parses_full_sample() {
        let q = parse(SAMPLE).unwrap();
        assert_eq!(q.functions.len(), 1);
        assert_eq!(q.functions[0].name, "includeRelatedCounters");
        assert_eq!(q.functions[0].params, vec!["d"]);
        assert_eq!(q.functions[0].body.len(), 3);
        assert_eq!(q.index, "Membership/ByEventAndUserId");
        assert_eq!(q.alias.as_deref(), Some("d"));
        assert_eq!(
            q.where_clause,
            Some(("UserId".to_string(), Value::String("User/Ayende".into())))
        );
        assert!(matches!(q.select, Some(Expr::Call(_, _))));
        assert!(q.timings);
    }

    #[test]
    fn parses_bare_from() {
        let q = parse(r#"from index "Idx/Name""#).unwrap();
        assert!(q.functions.is_empty());
        assert!(q.alias.is_none());
        assert!(q.where_clause.is_none());
        assert!(q.select.is_none());
        assert!(!q.timings);
    }

    #[test]
    fn where_accepts_numbers() {
        let q = parse(r#"from index "Idx" where Size = 42"#).unwrap();
        assert_eq!(q.where_clause, Some(("Size".to_string(), Value::from(42))));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse(r#"from index "Idx" nonsense"#).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[test]
    fn rejects_unterminated_string() {
        let err = parse(r#"from index "Idx"#).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }

    #[test]
    fn rejects_counter_arity() {
        let err = parse(
            r#"declare function f(d) { return counter(d.X) }
               from index "Idx" select f(d)"#,
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery(_)));
    }
}
