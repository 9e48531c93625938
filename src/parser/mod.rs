//! Statement reader for the classification grammar.
//!
//! Routing needs the statement kind, the relations it touches, and a
//! handful of markers (locking clause, SELECT INTO, modifying CTEs,
//! transaction options). This reader extracts exactly that; the full SQL
//! grammar is the backend's problem.

pub mod ast;

use crate::errors::Error;

use ast::{
    CopyTarget, IsolationLevel, LockMode, SelectStmt, Stmt, TableRef, TransactionOptions,
    TransactionVerb, VariableSetStmt,
};

/// A parsed statement alongside the raw text it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub stmt: Stmt,
    pub text: String,
    /// True when the original text held more than one statement; only the
    /// first is represented in `stmt`.
    pub is_multi_statement: bool,
}

/// Parse a query string. Multi-statement input parses the first statement
/// and sets the marker the router needs.
pub fn parse(text: &str) -> Result<ParsedQuery, Error> {
    let statements = split_statements(text);
    let first = statements.first().map(|s| s.as_str()).unwrap_or("");
    let stmt = parse_statement(first)?;
    Ok(ParsedQuery {
        stmt,
        text: text.to_string(),
        is_multi_statement: statements.len() > 1,
    })
}

/// Every top-level statement of a multi-statement string, parsed. Used when
/// scanning all statements for writes.
pub fn parse_all(text: &str) -> Result<Vec<Stmt>, Error> {
    split_statements(text)
        .iter()
        .map(|s| parse_statement(s))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Unquoted word, stored as written; compared case-insensitively.
    Word(String),
    /// Double-quoted identifier, quotes stripped.
    Ident(String),
    /// String or dollar-quoted literal, contents preserved.
    Literal(String),
    /// Numeric literal, raw text preserved.
    Number(String),
    Symbol(char),
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn name(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w.as_str()),
            Token::Ident(w) => Some(w.as_str()),
            _ => None,
        }
    }

    /// Identifier value with SQL case folding: unquoted words fold to
    /// lowercase, quoted identifiers keep their case.
    fn ident_value(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_ascii_lowercase()),
            Token::Ident(w) => Some(w.clone()),
            _ => None,
        }
    }
}

/// Split on top-level semicolons, respecting quotes and comments. Empty
/// trailing statements are dropped.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => {
                let end = skip_quoted(bytes, i, b'\'');
                current.push_str(&text[i..end]);
                i = end;
            }
            '"' => {
                let end = skip_quoted(bytes, i, b'"');
                current.push_str(&text[i..end]);
                i = end;
            }
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            ';' => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += c.len_utf8();
            }
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            // Doubled quotes escape themselves.
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let end = skip_quoted(bytes, i, b'\'');
            let inner = text[i + 1..end.saturating_sub(1)].replace("''", "'");
            tokens.push(Token::Literal(inner));
            i = end;
        } else if c == '"' {
            let end = skip_quoted(bytes, i, b'"');
            let inner = text[i + 1..end.saturating_sub(1)].replace("\"\"", "\"");
            tokens.push(Token::Ident(inner));
            i = end;
        } else if c == '$' && bytes.get(i + 1).is_some_and(|b| !b.is_ascii_digit()) {
            // Dollar-quoted literal: $tag$ ... $tag$.
            if let Some(tag_end) = text[i + 1..].find('$') {
                let tag = &text[i..i + tag_end + 2];
                if let Some(body_end) = text[i + tag.len()..].find(tag) {
                    let body = text[i + tag.len()..i + tag.len() + body_end].to_string();
                    i += tag.len() + body_end + tag.len();
                    tokens.push(Token::Literal(body));
                    continue;
                }
            }
            i += 1;
        } else if c == '-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push(Token::Word(text[start..i].to_string()));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'e')
            {
                i += 1;
            }
            tokens.push(Token::Number(text[start..i].to_string()));
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }
    tokens
}

/// Words that can precede `(` without being a function call.
const NON_FUNCTION_WORDS: &[&str] = &[
    "and", "or", "not", "in", "exists", "any", "all", "some", "between", "like", "ilike",
    "select", "from", "where", "group", "order", "by", "having", "limit", "offset", "on",
    "join", "inner", "outer", "left", "right", "full", "cross", "union", "intersect",
    "except", "as", "distinct", "values", "case", "when", "then", "else", "end", "is",
    "null", "true", "false", "cast", "using", "returning", "with", "recursive", "over",
    "partition", "filter", "within", "array", "row", "interval", "into", "insert",
    "update", "delete", "set", "asc", "desc",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            tokens: tokenize(text),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn accept_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_keyword(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn accept_any_keyword(&mut self, keywords: &[&str]) -> Option<String> {
        if let Some(Token::Word(w)) = self.peek() {
            let lower = w.to_ascii_lowercase();
            if keywords.contains(&lower.as_str()) {
                self.pos += 1;
                return Some(lower);
            }
        }
        None
    }

    /// `name` or `schema.name`, built from words or quoted identifiers.
    fn table_ref(&mut self) -> Option<TableRef> {
        let first = self.peek()?.ident_value()?;
        self.pos += 1;
        if self.peek() == Some(&Token::Symbol('.')) {
            if let Some(second) = self.peek_at(1).and_then(|t| t.ident_value()) {
                self.pos += 2;
                return Some(TableRef::new(Some(&first), &second));
            }
        }
        Some(TableRef::bare(&first))
    }

    fn table_ref_list(&mut self) -> Vec<TableRef> {
        let mut tables = Vec::new();
        loop {
            self.accept_keyword("only");
            match self.table_ref() {
                Some(t) => tables.push(t),
                None => break,
            }
            if self.peek() != Some(&Token::Symbol(',')) {
                break;
            }
            self.pos += 1;
        }
        tables
    }
}

/// Parse one statement of the classification grammar.
pub fn parse_statement(text: &str) -> Result<Stmt, Error> {
    let mut p = Parser::new(text);
    let first = match p.peek() {
        Some(Token::Word(w)) => w.to_ascii_lowercase(),
        Some(Token::Symbol('(')) => {
            // Parenthesized SELECT (e.g. set operations).
            return Ok(Stmt::Select(scan_select(&mut p, &[])));
        }
        _ => return Ok(Stmt::Other),
    };

    match first.as_str() {
        "select" | "table" => Ok(Stmt::Select(scan_select(&mut p, &[]))),
        "with" => parse_with(&mut p),
        "insert" => {
            p.next();
            p.accept_keyword("into");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Insert { table }),
                None => Ok(Stmt::Other),
            }
        }
        "update" => {
            p.next();
            p.accept_keyword("only");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Update { table }),
                None => Ok(Stmt::Other),
            }
        }
        "delete" => {
            p.next();
            p.accept_keyword("from");
            p.accept_keyword("only");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Delete { table }),
                None => Ok(Stmt::Other),
            }
        }
        "truncate" => {
            p.next();
            p.accept_keyword("table");
            Ok(Stmt::Truncate {
                tables: p.table_ref_list(),
            })
        }
        "create" => parse_create(&mut p),
        "drop" => parse_drop(&mut p),
        "alter" => {
            p.next();
            if p.accept_keyword("table") {
                p.accept_keyword("if");
                p.accept_keyword("exists");
                p.accept_keyword("only");
                match p.table_ref() {
                    Some(table) => Ok(Stmt::AlterTable { table }),
                    None => Ok(Stmt::Other),
                }
            } else {
                Ok(Stmt::Other)
            }
        }
        "copy" => parse_copy(&mut p),
        "lock" => parse_lock(&mut p),
        "begin" | "start" => parse_begin(&mut p),
        "commit" | "end" => {
            p.next();
            if p.accept_keyword("prepared") {
                Ok(Stmt::Transaction(TransactionVerb::CommitPrepared(
                    gid_argument(&mut p),
                )))
            } else {
                Ok(Stmt::Transaction(TransactionVerb::Commit))
            }
        }
        "rollback" | "abort" => {
            p.next();
            if p.accept_keyword("prepared") {
                return Ok(Stmt::Transaction(TransactionVerb::RollbackPrepared(
                    gid_argument(&mut p),
                )));
            }
            if p.accept_keyword("to") {
                p.accept_keyword("savepoint");
                let name = p.next().and_then(|t| t.name().map(String::from));
                return Ok(Stmt::Transaction(TransactionVerb::RollbackToSavepoint(
                    name.unwrap_or_default(),
                )));
            }
            Ok(Stmt::Transaction(TransactionVerb::Rollback))
        }
        "savepoint" => {
            p.next();
            let name = p.next().and_then(|t| t.name().map(String::from));
            Ok(Stmt::Transaction(TransactionVerb::Savepoint(
                name.unwrap_or_default(),
            )))
        }
        "release" => {
            p.next();
            p.accept_keyword("savepoint");
            let name = p.next().and_then(|t| t.name().map(String::from));
            Ok(Stmt::Transaction(TransactionVerb::ReleaseSavepoint(
                name.unwrap_or_default(),
            )))
        }
        "prepare" => parse_prepare(&mut p, text),
        "execute" => {
            p.next();
            match p.next().and_then(|t| t.name().map(String::from)) {
                Some(name) => Ok(Stmt::Execute { name }),
                None => Ok(Stmt::Other),
            }
        }
        "deallocate" => {
            p.next();
            p.accept_keyword("prepare");
            if p.accept_keyword("all") {
                Ok(Stmt::Deallocate { name: None })
            } else {
                Ok(Stmt::Deallocate {
                    name: p.next().and_then(|t| t.name().map(String::from)),
                })
            }
        }
        "set" => parse_set(&mut p),
        "show" => {
            p.next();
            let name = p
                .next()
                .and_then(|t| t.name().map(|n| n.to_ascii_lowercase()));
            Ok(Stmt::Show {
                name: name.unwrap_or_default(),
            })
        }
        "discard" => {
            p.next();
            let what = p
                .next()
                .and_then(|t| t.name().map(|n| n.to_ascii_lowercase()));
            Ok(Stmt::Discard {
                what: what.unwrap_or_default(),
            })
        }
        "explain" => {
            p.next();
            let mut analyze = false;
            // Options come bare (ANALYZE, VERBOSE) or parenthesized.
            if p.peek() == Some(&Token::Symbol('(')) {
                let mut depth = 0;
                while let Some(token) = p.next() {
                    match token {
                        Token::Symbol('(') => depth += 1,
                        Token::Symbol(')') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Token::Word(w) if w.eq_ignore_ascii_case("analyze") => analyze = true,
                        _ => {}
                    }
                }
            } else {
                while let Some(option) = p.accept_any_keyword(&["analyze", "verbose"]) {
                    if option == "analyze" {
                        analyze = true;
                    }
                }
            }
            let rest = remaining_text(text, &p);
            let query = Box::new(parse_statement(&rest)?);
            Ok(Stmt::Explain { analyze, query })
        }
        _ => Ok(Stmt::Other),
    }
}

/// Reconstruct the unparsed tail of `text` for recursive parsing. Token
/// positions do not map back to byte offsets, so re-lex from the keyword
/// boundary instead: find the tail that tokenizes to the remaining tokens.
fn remaining_text(text: &str, p: &Parser) -> String {
    let remaining = p.tokens.len() - p.pos;
    if remaining == 0 {
        return String::new();
    }
    // Walk forward word-by-word until the suffix tokenizes to the remainder.
    for (idx, _) in text.char_indices() {
        if tokenize(&text[idx..]).len() == remaining {
            return text[idx..].to_string();
        }
    }
    String::new()
}

fn gid_argument(p: &mut Parser) -> String {
    match p.next() {
        Some(Token::Literal(gid)) => gid,
        Some(token) => token.name().unwrap_or_default().to_string(),
        None => String::new(),
    }
}

fn parse_with(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // WITH
    p.accept_keyword("recursive");

    let mut cte_names = Vec::new();
    let mut cte_write_tables = Vec::new();
    // Relations and functions inside read-only CTE bodies still matter for
    // routing and cache safety.
    let mut cte_select = SelectStmt::default();

    loop {
        let name = match p.next().and_then(|t| t.ident_value()) {
            Some(name) => name,
            None => return Ok(Stmt::Other),
        };
        cte_names.push(name);

        // Optional column list; the body parenthesis only comes after AS.
        if p.peek() == Some(&Token::Symbol('(')) {
            skip_parenthesized(p);
        }
        if !p.accept_keyword("as") {
            return Ok(Stmt::Other);
        }
        p.accept_keyword("not");
        p.accept_keyword("materialized");

        // CTE body.
        if p.peek() != Some(&Token::Symbol('(')) {
            return Ok(Stmt::Other);
        }
        p.next();
        let body_start = p.pos;
        let mut depth = 1;
        while let Some(token) = p.next() {
            match token {
                Token::Symbol('(') => depth += 1,
                Token::Symbol(')') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        let body = &p.tokens[body_start..p.pos.saturating_sub(1)];
        if let Some(written) = cte_written_table(body) {
            cte_write_tables.push(written);
        } else {
            let mut body_parser = Parser {
                tokens: body.to_vec(),
                pos: 0,
            };
            let sub = scan_select(&mut body_parser, &cte_names);
            cte_select.tables.extend(sub.tables);
            cte_select.functions.extend(sub.functions);
        }

        if p.peek() == Some(&Token::Symbol(',')) {
            p.next();
            continue;
        }
        break;
    }

    // Main statement after the CTE list.
    match p.peek() {
        Some(t) if t.is_keyword("select") || t.is_keyword("table") => {
            let mut select = scan_select(p, &cte_names);
            select.cte_write_tables = cte_write_tables;
            let mut tables = cte_select.tables;
            tables.append(&mut select.tables);
            select.tables = tables;
            select.functions.extend(cte_select.functions);
            Ok(Stmt::Select(select))
        }
        Some(t) if t.is_keyword("insert") => {
            p.next();
            p.accept_keyword("into");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Insert { table }),
                None => Ok(Stmt::Other),
            }
        }
        Some(t) if t.is_keyword("update") => {
            p.next();
            p.accept_keyword("only");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Update { table }),
                None => Ok(Stmt::Other),
            }
        }
        Some(t) if t.is_keyword("delete") => {
            p.next();
            p.accept_keyword("from");
            match p.table_ref() {
                Some(table) => Ok(Stmt::Delete { table }),
                None => Ok(Stmt::Other),
            }
        }
        _ => Ok(Stmt::Other),
    }
}

fn cte_written_table(body: &[Token]) -> Option<TableRef> {
    let first = body.first()?;
    let mut p = Parser {
        tokens: body.to_vec(),
        pos: 0,
    };
    if first.is_keyword("insert") {
        p.next();
        p.accept_keyword("into");
        p.table_ref()
    } else if first.is_keyword("update") {
        p.next();
        p.accept_keyword("only");
        p.table_ref()
    } else if first.is_keyword("delete") {
        p.next();
        p.accept_keyword("from");
        p.table_ref()
    } else {
        None
    }
}

fn skip_parenthesized(p: &mut Parser) {
    if p.peek() != Some(&Token::Symbol('(')) {
        return;
    }
    p.next();
    let mut depth = 1;
    while let Some(token) = p.next() {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Scan a SELECT body, collecting relations, locking/INTO markers and
/// function calls. `cte_names` are excluded from the relation list.
/// Scan a SELECT body, collecting relations, locking/INTO markers and
/// function calls. `cte_names` are excluded from the relation list.
fn scan_select(p: &mut Parser, cte_names: &[String]) -> SelectStmt {
    let mut select = SelectStmt::default();
    let mut expect_table = false;
    let mut depth: usize = 0;
    // Depth at which a FROM list is open; commas there separate relations.
    let mut from_depth: Option<usize> = None;

    while let Some(token) = p.next() {
        match &token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth = depth.saturating_sub(1);
                if from_depth.is_some_and(|d| d > depth) {
                    from_depth = None;
                }
            }
            Token::Symbol(',') => {
                if from_depth == Some(depth) {
                    expect_table = true;
                }
            }
            Token::Word(w) => {
                let lower = w.to_ascii_lowercase();
                match lower.as_str() {
                    "from" => {
                        from_depth = Some(depth);
                        expect_table = true;
                    }
                    "join" | "table" => expect_table = true,
                    "only" | "lateral" => {} // keep expect_table as is
                    "where" | "group" | "having" | "window" | "order" | "limit" | "offset"
                    | "union" | "intersect" | "except" | "returning" | "on" | "using" => {
                        if from_depth == Some(depth) {
                            from_depth = None;
                        }
                        expect_table = false;
                    }
                    "into" => select.has_select_into = true,
                    "tablesample" => select.has_tablesample = true,
                    "for" => {
                        // FOR UPDATE / NO KEY UPDATE / SHARE / KEY SHARE.
                        if p.peek().is_some_and(|t| {
                            t.is_keyword("update")
                                || t.is_keyword("share")
                                || t.is_keyword("no")
                                || t.is_keyword("key")
                        }) {
                            select.has_locking_clause = true;
                        }
                    }
                    _ => {
                        if p.peek() == Some(&Token::Symbol('(')) {
                            if !NON_FUNCTION_WORDS.contains(&lower.as_str()) {
                                if lower == "pg_terminate_backend" {
                                    if let Some(Token::Number(n)) = p.peek_at(1) {
                                        select.terminate_backend_pid = n.parse().ok();
                                    }
                                }
                                select.functions.push(lower);
                            }
                            expect_table = false;
                        } else if expect_table {
                            if NON_FUNCTION_WORDS.contains(&lower.as_str()) {
                                expect_table = false;
                            } else {
                                p.pos -= 1;
                                if let Some(table) = p.table_ref() {
                                    if !cte_names.contains(&table.name) {
                                        select.tables.push(table);
                                    }
                                }
                                expect_table = false;
                            }
                        }
                    }
                }
            }
            Token::Ident(_) => {
                if expect_table {
                    p.pos -= 1;
                    if let Some(table) = p.table_ref() {
                        if !cte_names.contains(&table.name) {
                            select.tables.push(table);
                        }
                    }
                    expect_table = false;
                }
            }
            _ => {}
        }
    }
    select
}

fn parse_create(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // CREATE
    p.accept_keyword("global");
    p.accept_keyword("local");
    let temp = p.accept_keyword("temp") || p.accept_keyword("temporary");
    let unlogged = p.accept_keyword("unlogged");
    if p.accept_keyword("table") {
        p.accept_keyword("if");
        p.accept_keyword("not");
        p.accept_keyword("exists");
        match p.table_ref() {
            Some(table) => Ok(Stmt::CreateTable {
                table,
                temp,
                unlogged,
            }),
            None => Ok(Stmt::Other),
        }
    } else {
        Ok(Stmt::Other)
    }
}

fn parse_drop(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // DROP
    if p.accept_keyword("table") {
        p.accept_keyword("if");
        p.accept_keyword("exists");
        Ok(Stmt::DropTable {
            tables: p.table_ref_list(),
        })
    } else if p.accept_keyword("database") {
        p.accept_keyword("if");
        p.accept_keyword("exists");
        let name = p
            .next()
            .and_then(|t| t.name().map(|n| n.to_ascii_lowercase()));
        Ok(Stmt::DropDatabase {
            name: name.unwrap_or_default(),
        })
    } else {
        Ok(Stmt::Other)
    }
}

fn parse_copy(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // COPY
    if p.peek() == Some(&Token::Symbol('(')) {
        let is_select = p
            .peek_at(1)
            .is_some_and(|t| t.is_keyword("select") || t.is_keyword("with") || t.is_keyword("table"));
        skip_parenthesized(p);
        let is_from = p.accept_keyword("from");
        return Ok(Stmt::Copy {
            target: CopyTarget::Query { is_select },
            is_from,
        });
    }
    let table = match p.table_ref() {
        Some(table) => table,
        None => return Ok(Stmt::Other),
    };
    if p.peek() == Some(&Token::Symbol('(')) {
        skip_parenthesized(p); // column list
    }
    let is_from = p.accept_keyword("from");
    if !is_from {
        p.accept_keyword("to");
    }
    Ok(Stmt::Copy {
        target: CopyTarget::Table(table),
        is_from,
    })
}

fn parse_lock(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // LOCK
    p.accept_keyword("table");
    let tables = p.table_ref_list();

    // Unqualified LOCK TABLE takes ACCESS EXCLUSIVE.
    let mut mode = LockMode::AccessExclusive;
    if p.accept_keyword("in") {
        let mut words = Vec::new();
        while let Some(word) = p.accept_any_keyword(&[
            "access", "row", "share", "update", "exclusive", "mode",
        ]) {
            if word == "mode" {
                break;
            }
            words.push(word);
        }
        mode = match words.join(" ").as_str() {
            "access share" => LockMode::AccessShare,
            "row share" => LockMode::RowShare,
            "row exclusive" => LockMode::RowExclusive,
            "share update exclusive" => LockMode::ShareUpdateExclusive,
            "share" => LockMode::Share,
            "share row exclusive" => LockMode::ShareRowExclusive,
            "exclusive" => LockMode::Exclusive,
            _ => LockMode::AccessExclusive,
        };
    }
    Ok(Stmt::Lock { tables, mode })
}

fn parse_begin(p: &mut Parser) -> Result<Stmt, Error> {
    let starter = p.next(); // BEGIN or START
    if starter.is_some_and(|t| t.is_keyword("start")) && !p.accept_keyword("transaction") {
        return Ok(Stmt::Other);
    }
    p.accept_keyword("work");
    p.accept_keyword("transaction");

    let mut options = TransactionOptions::default();
    loop {
        if p.accept_keyword("read") {
            if p.accept_keyword("write") {
                options.read_write = Some(true);
            } else if p.accept_keyword("only") {
                options.read_write = Some(false);
            }
        } else if p.accept_keyword("serializable") {
            options.isolation = IsolationLevel::Serializable;
        } else if p.accept_keyword("isolation") {
            p.accept_keyword("level");
            if p.accept_keyword("serializable") {
                options.isolation = IsolationLevel::Serializable;
            } else if p.accept_keyword("repeatable") {
                p.accept_keyword("read");
                options.isolation = IsolationLevel::RepeatableRead;
            } else if p.accept_keyword("read") {
                if !p.accept_keyword("committed") {
                    p.accept_keyword("uncommitted");
                }
                options.isolation = IsolationLevel::ReadCommitted;
            }
        } else if p.accept_keyword("deferrable") || p.accept_keyword("not") {
            p.accept_keyword("deferrable");
        } else if p.peek() == Some(&Token::Symbol(',')) {
            p.next();
        } else {
            break;
        }
    }
    Ok(Stmt::Transaction(TransactionVerb::Begin(options)))
}

fn parse_prepare(p: &mut Parser, text: &str) -> Result<Stmt, Error> {
    p.next(); // PREPARE
    if p.peek().is_some_and(|t| t.is_keyword("transaction")) {
        p.next();
        return Ok(Stmt::Transaction(TransactionVerb::PrepareTransaction(
            gid_argument(p),
        )));
    }
    let name = match p.next().and_then(|t| t.name().map(String::from)) {
        Some(name) => name,
        None => return Ok(Stmt::Other),
    };
    if p.peek() == Some(&Token::Symbol('(')) {
        skip_parenthesized(p); // parameter types
    }
    if !p.accept_keyword("as") {
        return Ok(Stmt::Other);
    }
    let rest = remaining_text(text, p);
    Ok(Stmt::Prepare {
        name,
        query: Box::new(parse_statement(&rest)?),
    })
}

fn parse_set(p: &mut Parser) -> Result<Stmt, Error> {
    p.next(); // SET
    if p.accept_keyword("local") {
        // scope only affects lifetime, not routing
    } else if p.accept_keyword("session") && p.accept_keyword("characteristics") {
        // SET SESSION CHARACTERISTICS AS TRANSACTION ...
        p.accept_keyword("as");
        p.accept_keyword("transaction");
        return Ok(Stmt::Set(VariableSetStmt {
            name: "session characteristics".into(),
            args: remaining_words(p),
        }));
    }

    if p.peek().is_some_and(|t| t.is_keyword("transaction")) {
        p.next();
        return Ok(Stmt::Set(VariableSetStmt {
            name: "transaction".into(),
            args: remaining_words(p),
        }));
    }

    let name = match p.next() {
        Some(token) => match token.name() {
            Some(name) => name.to_ascii_lowercase(),
            None => return Ok(Stmt::Other),
        },
        None => return Ok(Stmt::Other),
    };
    // TO / = separator.
    p.accept_keyword("to");
    if p.peek() == Some(&Token::Symbol('=')) {
        p.next();
    }
    Ok(Stmt::Set(VariableSetStmt {
        name,
        args: remaining_words(p),
    }))
}

fn remaining_words(p: &mut Parser) -> Vec<String> {
    let mut words = Vec::new();
    while let Some(token) = p.next() {
        match token {
            Token::Word(w) => words.push(w.to_ascii_lowercase()),
            Token::Ident(w) => words.push(w),
            Token::Number(n) => words.push(n),
            Token::Literal(l) => words.push(l.to_ascii_lowercase()),
            _ => {}
        }
    }
    words
}
