//! Cypher recursive descent parser.
//!
//! Parses token streams into AST nodes. Supports:
//! - MATCH / OPTIONAL MATCH with patterns, named paths, shortestPath
//! - WHERE, WITH pipelines, UNWIND, RETURN, ORDER BY, SKIP, LIMIT
//! - CREATE, MERGE (ON CREATE / ON MATCH SET), SET, REMOVE,
//!   DELETE / DETACH DELETE
//! - CALL ... YIELD ... [WHERE], UNION [ALL], EXPLAIN, SHOW
//! - Schema commands: CREATE/DROP INDEX (range, vector, fulltext) and
//!   CREATE/DROP CONSTRAINT
//! - Full expression parsing with precedence

use std::collections::HashMap;

use crate::{Error, Result};

use super::ast::*;
use super::lexer::{Token, TokenKind};

/// Parser state: a token slice with a cursor.
struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(TokenKind::Eof, |t| t.kind)
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&Token> {
        let tok = self.peek();
        if tok.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("Expected {:?}, got {:?} '{}'", kind, tok.kind, tok.text)))
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Case-insensitive check against a bare identifier (soft keyword).
    fn at_word(&self, word: &str) -> bool {
        self.at(TokenKind::Identifier) && self.peek().text.eq_ignore_ascii_case(word)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.at_word(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// A name position: identifiers and keywords are both acceptable
    /// (labels and property keys may collide with reserved words).
    fn expect_name(&mut self) -> Result<String> {
        let tok = self.peek();
        if tok.kind.is_wordlike() && tok.kind != TokenKind::Eof {
            let text = tok.text.clone();
            self.advance();
            Ok(text)
        } else {
            Err(self.error(format!("Expected a name, got {:?} '{}'", tok.kind, tok.text)))
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::SyntaxError {
            position: self.peek().span.start,
            message: msg,
        }
    }
}

/// Parse a complete Cypher statement from tokens.
pub fn parse_statement(tokens: &[Token]) -> Result<Statement> {
    let mut p = Parser::new(tokens);
    let stmt = parse_statement_inner(&mut p)?;

    p.eat(TokenKind::Semicolon);
    if !p.at(TokenKind::Eof) {
        return Err(p.error(format!(
            "Unexpected token after statement: {:?} '{}'",
            p.peek_kind(),
            p.peek().text
        )));
    }
    Ok(stmt)
}

fn parse_statement_inner(p: &mut Parser) -> Result<Statement> {
    if p.eat(TokenKind::Explain) {
        return Ok(Statement::Explain(Box::new(parse_statement_inner(p)?)));
    }
    if p.eat(TokenKind::Show) {
        return parse_show(p);
    }
    if p.at(TokenKind::Drop) {
        return parse_schema_stmt(p);
    }
    if p.at(TokenKind::Create) && starts_schema_command(p) {
        return parse_schema_stmt(p);
    }

    let first = parse_query(p)?;
    if !p.at(TokenKind::Union) {
        return Ok(Statement::Query(first));
    }

    // UNION chain; ALL must be consistent across branches.
    let mut branches = vec![first];
    let mut all = None;
    while p.eat(TokenKind::Union) {
        let this_all = p.eat(TokenKind::All);
        match all {
            None => all = Some(this_all),
            Some(prev) if prev != this_all => {
                return Err(p.error("cannot mix UNION and UNION ALL".into()));
            }
            Some(_) => {}
        }
        branches.push(parse_query(p)?);
    }
    Ok(Statement::Union { branches, all: all.unwrap_or(false) })
}

/// Lookahead: does this CREATE start a schema command rather than a pattern?
fn starts_schema_command(p: &Parser) -> bool {
    // CREATE INDEX / CREATE CONSTRAINT / CREATE VECTOR INDEX / ...
    match p.peek_ahead(1) {
        TokenKind::Index | TokenKind::Constraint => true,
        TokenKind::Identifier => {
            let text = &p.tokens[p.pos + 1].text;
            (text.eq_ignore_ascii_case("VECTOR")
                || text.eq_ignore_ascii_case("FULLTEXT")
                || text.eq_ignore_ascii_case("TEXT")
                || text.eq_ignore_ascii_case("RANGE")
                || text.eq_ignore_ascii_case("BTREE")
                || text.eq_ignore_ascii_case("LOOKUP"))
                && p.peek_ahead(2) == TokenKind::Index
        }
        _ => false,
    }
}

fn parse_show(p: &mut Parser) -> Result<Statement> {
    if p.eat(TokenKind::Index) || p.eat_word("INDEXES") {
        return Ok(Statement::Show(ShowTarget::Indexes));
    }
    if p.eat(TokenKind::Constraint) || p.eat_word("CONSTRAINTS") {
        return Ok(Statement::Show(ShowTarget::Constraints));
    }
    Err(p.error("Expected INDEXES or CONSTRAINTS after SHOW".into()))
}

// ============================================================================
// Query (clause sequence)
// ============================================================================

fn parse_query(p: &mut Parser) -> Result<Query> {
    let mut clauses = Vec::new();

    loop {
        match p.peek_kind() {
            TokenKind::Match => {
                p.advance();
                clauses.push(parse_match_clause(p, false)?);
            }
            TokenKind::Optional => {
                p.advance();
                p.expect(TokenKind::Match)?;
                clauses.push(parse_match_clause(p, true)?);
            }
            TokenKind::Unwind => {
                p.advance();
                let expr = parse_expr(p)?;
                p.expect(TokenKind::As)?;
                let alias = p.expect_name()?;
                clauses.push(Clause::Unwind { expr, alias });
            }
            TokenKind::With => {
                p.advance();
                clauses.push(Clause::With(parse_projection(p, true)?));
            }
            TokenKind::Create => {
                p.advance();
                let patterns = parse_pattern_list(p)?;
                clauses.push(Clause::Create { patterns });
            }
            TokenKind::Merge => {
                p.advance();
                clauses.push(parse_merge_clause(p)?);
            }
            TokenKind::Set => {
                p.advance();
                let items = parse_set_items(p)?;
                clauses.push(Clause::Set { items });
            }
            TokenKind::Remove => {
                p.advance();
                let items = parse_remove_items(p)?;
                clauses.push(Clause::Remove { items });
            }
            TokenKind::Delete => {
                p.advance();
                let variables = parse_variable_list(p)?;
                clauses.push(Clause::Delete { variables, detach: false });
            }
            TokenKind::Detach => {
                p.advance();
                p.expect(TokenKind::Delete)?;
                let variables = parse_variable_list(p)?;
                clauses.push(Clause::Delete { variables, detach: true });
            }
            TokenKind::Call => {
                p.advance();
                clauses.push(parse_call_clause(p)?);
            }
            TokenKind::Return => {
                p.advance();
                clauses.push(Clause::Return(parse_projection(p, false)?));
                break;
            }
            TokenKind::Eof | TokenKind::Semicolon | TokenKind::Union => break,
            kind => {
                return Err(p.error(format!(
                    "Unexpected token {:?} '{}' at start of clause",
                    kind,
                    p.peek().text
                )));
            }
        }
    }

    if clauses.is_empty() {
        return Err(p.error("Empty statement".into()));
    }
    Ok(Query { clauses })
}

fn parse_match_clause(p: &mut Parser, optional: bool) -> Result<Clause> {
    let patterns = parse_pattern_list(p)?;
    let where_clause = if p.eat(TokenKind::Where) {
        Some(parse_expr(p)?)
    } else {
        None
    };
    Ok(Clause::Match { optional, patterns, where_clause })
}

fn parse_merge_clause(p: &mut Parser) -> Result<Clause> {
    let pattern = parse_pattern(p)?;

    let mut on_create = Vec::new();
    let mut on_match = Vec::new();
    while p.at(TokenKind::On) {
        p.advance();
        if p.eat(TokenKind::Create) {
            p.expect(TokenKind::Set)?;
            on_create.extend(parse_set_items(p)?);
        } else if p.eat(TokenKind::Match) {
            p.expect(TokenKind::Set)?;
            on_match.extend(parse_set_items(p)?);
        } else {
            return Err(p.error(format!(
                "Expected CREATE or MATCH after ON, got '{}'",
                p.peek().text
            )));
        }
    }

    Ok(Clause::Merge { pattern, on_create, on_match })
}

fn parse_call_clause(p: &mut Parser) -> Result<Clause> {
    // Procedure name: dotted word path (db.index.vector.queryNodes).
    let mut procedure = p.expect_name()?;
    while p.eat(TokenKind::Dot) {
        let part = p.expect_name()?;
        procedure = format!("{procedure}.{part}");
    }

    let mut args = Vec::new();
    if p.eat(TokenKind::LParen) {
        if !p.at(TokenKind::RParen) {
            args.push(parse_expr(p)?);
            while p.eat(TokenKind::Comma) {
                args.push(parse_expr(p)?);
            }
        }
        p.expect(TokenKind::RParen)?;
    }

    let mut yields = Vec::new();
    let mut where_clause = None;
    if p.eat(TokenKind::Yield) {
        loop {
            let column = p.expect_name()?;
            let alias = if p.eat(TokenKind::As) {
                Some(p.expect_name()?)
            } else {
                None
            };
            yields.push(YieldItem { column, alias });
            if !p.eat(TokenKind::Comma) {
                break;
            }
        }
        if p.eat(TokenKind::Where) {
            where_clause = Some(parse_expr(p)?);
        }
    }

    Ok(Clause::Call { procedure, args, yields, where_clause })
}

/// Shared WITH / RETURN body. WITH additionally allows a trailing WHERE.
fn parse_projection(p: &mut Parser, is_with: bool) -> Result<Projection> {
    let distinct = p.eat(TokenKind::Distinct);
    let mut items = Vec::new();

    if p.at(TokenKind::Star) {
        p.advance();
        items.push(ReturnItem { expr: Expr::Star, alias: None });
        while p.eat(TokenKind::Comma) {
            items.push(parse_return_item(p)?);
        }
    } else {
        items.push(parse_return_item(p)?);
        while p.eat(TokenKind::Comma) {
            items.push(parse_return_item(p)?);
        }
    }

    let mut order_by = None;
    let mut skip = None;
    let mut limit = None;
    let mut where_clause = None;

    loop {
        if p.at(TokenKind::Order) {
            p.advance();
            p.expect(TokenKind::By)?;
            order_by = Some(parse_order_by(p)?);
        } else if p.at(TokenKind::Skip) {
            p.advance();
            skip = Some(parse_expr(p)?);
        } else if p.at(TokenKind::Limit) {
            p.advance();
            limit = Some(parse_expr(p)?);
        } else if is_with && p.at(TokenKind::Where) && where_clause.is_none() {
            p.advance();
            where_clause = Some(parse_expr(p)?);
        } else {
            break;
        }
    }

    Ok(Projection { distinct, items, where_clause, order_by, skip, limit })
}

fn parse_return_item(p: &mut Parser) -> Result<ReturnItem> {
    let expr = parse_expr(p)?;
    let alias = if p.eat(TokenKind::As) {
        Some(p.expect_name()?)
    } else {
        None
    };
    Ok(ReturnItem { expr, alias })
}

fn parse_order_by(p: &mut Parser) -> Result<Vec<OrderExpr>> {
    let mut exprs = Vec::new();
    loop {
        let expr = parse_expr(p)?;
        let ascending = if p.eat(TokenKind::Desc) {
            false
        } else {
            p.eat(TokenKind::Asc);
            true
        };
        exprs.push(OrderExpr { expr, ascending });
        if !p.eat(TokenKind::Comma) {
            break;
        }
    }
    Ok(exprs)
}

fn parse_set_items(p: &mut Parser) -> Result<Vec<SetItem>> {
    let mut items = Vec::new();
    items.push(parse_set_item(p)?);
    while p.eat(TokenKind::Comma) {
        items.push(parse_set_item(p)?);
    }
    Ok(items)
}

fn parse_set_item(p: &mut Parser) -> Result<SetItem> {
    let name = p.expect_name()?;

    if p.eat(TokenKind::Dot) {
        let key = p.expect_name()?;
        p.expect(TokenKind::Eq)?;
        let value = parse_expr(p)?;
        Ok(SetItem::Property { variable: name, key, value })
    } else if p.eat(TokenKind::PlusEq) {
        let value = parse_expr(p)?;
        Ok(SetItem::MergeProperties { variable: name, value })
    } else if p.eat(TokenKind::Eq) {
        let value = parse_expr(p)?;
        Ok(SetItem::AllProperties { variable: name, value })
    } else if p.at(TokenKind::Colon) {
        p.advance();
        let label = p.expect_name()?;
        Ok(SetItem::Label { variable: name, label })
    } else {
        Err(p.error("Expected '.', '=', '+=', or ':' after SET variable".into()))
    }
}

fn parse_remove_items(p: &mut Parser) -> Result<Vec<RemoveItem>> {
    let mut items = Vec::new();
    loop {
        let name = p.expect_name()?;
        if p.eat(TokenKind::Dot) {
            let key = p.expect_name()?;
            items.push(RemoveItem::Property { variable: name, key });
        } else if p.at(TokenKind::Colon) {
            p.advance();
            let label = p.expect_name()?;
            items.push(RemoveItem::Label { variable: name, label });
        } else {
            return Err(p.error("Expected '.' or ':' after REMOVE variable".into()));
        }
        if !p.eat(TokenKind::Comma) {
            break;
        }
    }
    Ok(items)
}

fn parse_variable_list(p: &mut Parser) -> Result<Vec<String>> {
    let mut vars = Vec::new();
    vars.push(p.expect_name()?);
    while p.eat(TokenKind::Comma) {
        vars.push(p.expect_name()?);
    }
    Ok(vars)
}

// ============================================================================
// Pattern parsing
// ============================================================================

fn parse_pattern_list(p: &mut Parser) -> Result<Vec<Pattern>> {
    let mut patterns = Vec::new();
    patterns.push(parse_pattern(p)?);
    while p.eat(TokenKind::Comma) {
        patterns.push(parse_pattern(p)?);
    }
    Ok(patterns)
}

fn parse_pattern(p: &mut Parser) -> Result<Pattern> {
    // Named path: `p = ...`
    let name = if p.at(TokenKind::Identifier) && p.peek_ahead(1) == TokenKind::Eq {
        let name = p.advance().text.clone();
        p.advance(); // =
        Some(name)
    } else {
        None
    };

    // shortestPath(...) / allShortestPaths(...)
    let path_fn = if p.at_word("shortestPath") {
        p.advance();
        Some(PathFunction::ShortestPath)
    } else if p.at_word("allShortestPaths") {
        p.advance();
        Some(PathFunction::AllShortestPaths)
    } else {
        None
    };

    let elements = if path_fn.is_some() {
        p.expect(TokenKind::LParen)?;
        let elements = parse_pattern_elements(p)?;
        p.expect(TokenKind::RParen)?;
        elements
    } else {
        parse_pattern_elements(p)?
    };

    Ok(Pattern { name, path_fn, elements })
}

fn parse_pattern_elements(p: &mut Parser) -> Result<Vec<PatternElement>> {
    let mut elements = Vec::new();
    elements.push(PatternElement::Node(parse_node_pattern(p)?));
    while p.at(TokenKind::Dash) || p.at(TokenKind::LeftArrow) {
        elements.push(PatternElement::Relationship(parse_rel_pattern(p)?));
        elements.push(PatternElement::Node(parse_node_pattern(p)?));
    }
    Ok(elements)
}

fn parse_node_pattern(p: &mut Parser) -> Result<NodePattern> {
    p.expect(TokenKind::LParen)?;

    let mut node = NodePattern::default();

    if p.at(TokenKind::Identifier) {
        node.alias = Some(p.advance().text.clone());
    }

    while p.at(TokenKind::Colon) {
        p.advance();
        node.labels.push(p.expect_name()?);
    }

    if p.at(TokenKind::LBrace) {
        node.properties = parse_map_literal_inner(p)?;
    }

    p.expect(TokenKind::RParen)?;
    Ok(node)
}

fn parse_rel_pattern(p: &mut Parser) -> Result<RelPattern> {
    // <-[...]-   or   -[...]->   or   -[...]-
    let left_arrow = p.eat(TokenKind::LeftArrow);
    if !left_arrow {
        p.expect(TokenKind::Dash)?;
    }

    let mut alias = None;
    let mut rel_types = Vec::new();
    let mut properties = HashMap::new();
    let mut var_length = None;

    if p.at(TokenKind::LBracket) {
        p.advance();

        if p.at(TokenKind::Identifier) {
            alias = Some(p.advance().text.clone());
        }

        if p.at(TokenKind::Colon) {
            p.advance();
            rel_types.push(p.expect_name()?);
            while p.eat(TokenKind::Pipe) {
                // Allow both `:A|B` and `:A|:B`.
                p.eat(TokenKind::Colon);
                rel_types.push(p.expect_name()?);
            }
        }

        if p.eat(TokenKind::Star) {
            let min = if p.at(TokenKind::Integer) {
                Some(parse_usize(p)?)
            } else {
                None
            };
            if p.eat(TokenKind::DotDot) {
                let max = if p.at(TokenKind::Integer) {
                    Some(parse_usize(p)?)
                } else {
                    None
                };
                var_length = Some(VarLength { min, max });
            } else if let Some(n) = min {
                var_length = Some(VarLength { min: Some(n), max: Some(n) });
            } else {
                var_length = Some(VarLength { min: None, max: None });
            }
        }

        if p.at(TokenKind::LBrace) {
            properties = parse_map_literal_inner(p)?;
        }

        p.expect(TokenKind::RBracket)?;
    }

    let direction = if left_arrow {
        p.expect(TokenKind::Dash)?;
        PatternDirection::Left
    } else if p.eat(TokenKind::Arrow) {
        PatternDirection::Right
    } else {
        p.expect(TokenKind::Dash)?;
        PatternDirection::Both
    };

    Ok(RelPattern { alias, rel_types, direction, properties, var_length })
}

fn parse_usize(p: &mut Parser) -> Result<usize> {
    let tok = p.expect(TokenKind::Integer)?;
    tok.text
        .parse()
        .map_err(|_| Error::SyntaxError {
            position: tok.span.start,
            message: format!("Invalid integer '{}'", tok.text),
        })
}

// ============================================================================
// Schema commands
// ============================================================================

fn parse_schema_stmt(p: &mut Parser) -> Result<Statement> {
    if p.eat(TokenKind::Create) {
        let kind = parse_index_kind(p);
        if p.eat(TokenKind::Index) {
            parse_create_index(p, kind)
        } else if p.eat(TokenKind::Constraint) {
            parse_create_constraint(p)
        } else {
            Err(p.error("Expected INDEX or CONSTRAINT after CREATE".into()))
        }
    } else if p.eat(TokenKind::Drop) {
        if p.eat(TokenKind::Index) {
            parse_drop_index(p)
        } else if p.eat(TokenKind::Constraint) {
            parse_drop_constraint(p)
        } else {
            Err(p.error("Expected INDEX or CONSTRAINT after DROP".into()))
        }
    } else {
        Err(p.error("Expected CREATE or DROP for schema command".into()))
    }
}

fn parse_index_kind(p: &mut Parser) -> IndexKind {
    if p.eat_word("VECTOR") {
        IndexKind::Vector
    } else if p.eat_word("FULLTEXT") || p.eat_word("TEXT") {
        IndexKind::Fulltext
    } else {
        let _ = p.eat_word("RANGE") || p.eat_word("BTREE") || p.eat_word("LOOKUP");
        IndexKind::Range
    }
}

/// `IF NOT EXISTS` is accepted and ignored (creation is idempotent).
fn eat_if_not_exists(p: &mut Parser) {
    if p.at_word("IF") && p.peek_ahead(1) == TokenKind::Not {
        p.advance();
        p.advance();
        p.eat(TokenKind::Exists);
    }
}

fn parse_create_index(p: &mut Parser, kind: IndexKind) -> Result<Statement> {
    eat_if_not_exists(p);

    // Optional index name before FOR/ON.
    let name = if p.at(TokenKind::Identifier)
        && matches!(p.peek_ahead(1), TokenKind::For | TokenKind::On | TokenKind::Eof)
    {
        Some(p.advance().text.clone())
    } else {
        None
    };
    eat_if_not_exists(p);

    // Legacy form: CREATE INDEX ON :Label(property)
    if p.eat(TokenKind::On) && p.at(TokenKind::Colon) {
        p.advance();
        let label = p.expect_name()?;
        p.expect(TokenKind::LParen)?;
        let mut properties = vec![p.expect_name()?];
        while p.eat(TokenKind::Comma) {
            properties.push(p.expect_name()?);
        }
        p.expect(TokenKind::RParen)?;
        return Ok(Statement::Schema(SchemaCommand::CreateIndex {
            name,
            kind,
            label,
            properties,
            options: HashMap::new(),
        }));
    }

    // Modern form: CREATE INDEX [name] FOR (n:Label) ON [EACH] (n.p1[, n.p2])
    p.expect(TokenKind::For)?;
    p.expect(TokenKind::LParen)?;
    let _alias = p.expect_name()?;
    p.expect(TokenKind::Colon)?;
    let label = p.expect_name()?;
    p.expect(TokenKind::RParen)?;

    p.expect(TokenKind::On)?;
    let _ = p.eat_word("EACH");
    p.expect(TokenKind::LParen)?;
    let mut properties = Vec::new();
    loop {
        let _alias = p.expect_name()?;
        p.expect(TokenKind::Dot)?;
        properties.push(p.expect_name()?);
        if !p.eat(TokenKind::Comma) {
            break;
        }
    }
    p.expect(TokenKind::RParen)?;

    let options = if p.eat_word("OPTIONS") {
        parse_map_literal_inner(p)?
    } else {
        HashMap::new()
    };

    Ok(Statement::Schema(SchemaCommand::CreateIndex {
        name,
        kind,
        label,
        properties,
        options,
    }))
}

fn parse_create_constraint(p: &mut Parser) -> Result<Statement> {
    eat_if_not_exists(p);
    let name = if p.at(TokenKind::Identifier)
        && matches!(p.peek_ahead(1), TokenKind::For | TokenKind::On)
    {
        Some(p.advance().text.clone())
    } else {
        None
    };
    eat_if_not_exists(p);

    if !p.eat(TokenKind::For) && !p.eat(TokenKind::On) {
        return Err(p.error("Expected FOR or ON after CONSTRAINT".into()));
    }

    p.expect(TokenKind::LParen)?;
    let _alias = p.expect_name()?;
    p.expect(TokenKind::Colon)?;
    let label = p.expect_name()?;
    p.expect(TokenKind::RParen)?;

    p.expect(TokenKind::Require)?;
    let _alias2 = p.expect_name()?;
    p.expect(TokenKind::Dot)?;
    let property = p.expect_name()?;

    p.expect(TokenKind::Is)?;
    if !p.eat(TokenKind::Unique) {
        return Err(p.error("Only IS UNIQUE constraints are supported".into()));
    }

    Ok(Statement::Schema(SchemaCommand::CreateConstraint { name, label, property }))
}

fn parse_drop_index(p: &mut Parser) -> Result<Statement> {
    if p.eat(TokenKind::On) {
        p.expect(TokenKind::Colon)?;
        let label = p.expect_name()?;
        p.expect(TokenKind::LParen)?;
        let property = p.expect_name()?;
        p.expect(TokenKind::RParen)?;
        Ok(Statement::Schema(SchemaCommand::DropIndex {
            name: None,
            label: Some(label),
            property: Some(property),
        }))
    } else {
        let name = p.expect_name()?;
        Ok(Statement::Schema(SchemaCommand::DropIndex {
            name: Some(name),
            label: None,
            property: None,
        }))
    }
}

fn parse_drop_constraint(p: &mut Parser) -> Result<Statement> {
    if p.eat(TokenKind::On) {
        p.expect(TokenKind::LParen)?;
        let _alias = p.expect_name()?;
        p.expect(TokenKind::Colon)?;
        let label = p.expect_name()?;
        p.expect(TokenKind::RParen)?;
        p.expect(TokenKind::Require)?;
        let _alias2 = p.expect_name()?;
        p.expect(TokenKind::Dot)?;
        let property = p.expect_name()?;
        p.expect(TokenKind::Is)?;
        p.expect(TokenKind::Unique)?;
        Ok(Statement::Schema(SchemaCommand::DropConstraint {
            name: None,
            label: Some(label),
            property: Some(property),
        }))
    } else {
        let name = p.expect_name()?;
        Ok(Statement::Schema(SchemaCommand::DropConstraint {
            name: Some(name),
            label: None,
            property: None,
        }))
    }
}

// ============================================================================
// Expression parsing (precedence climbing)
// ============================================================================

fn parse_expr(p: &mut Parser) -> Result<Expr> {
    parse_or_expr(p)
}

fn parse_or_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_xor_expr(p)?;
    while p.eat(TokenKind::Or) {
        let right = parse_xor_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Or, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_xor_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_and_expr(p)?;
    while p.eat(TokenKind::Xor) {
        let right = parse_and_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Xor, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_and_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_not_expr(p)?;
    while p.eat(TokenKind::And) {
        let right = parse_not_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::And, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_not_expr(p: &mut Parser) -> Result<Expr> {
    if p.eat(TokenKind::Not) {
        let expr = parse_not_expr(p)?;
        Ok(Expr::UnaryOp { op: UnaryOp::Not, expr: Box::new(expr) })
    } else {
        parse_comparison(p)
    }
}

fn parse_comparison(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_string_op(p)?;

    if p.at(TokenKind::Is) {
        p.advance();
        let negated = p.eat(TokenKind::Not);
        p.expect(TokenKind::Null)?;
        return Ok(Expr::IsNull { expr: Box::new(left), negated });
    }

    if p.at(TokenKind::In) {
        p.advance();
        let list = parse_addition(p)?;
        return Ok(Expr::In { expr: Box::new(left), list: Box::new(list) });
    }

    let op = match p.peek_kind() {
        TokenKind::Eq => Some(BinaryOp::Eq),
        TokenKind::Neq => Some(BinaryOp::Neq),
        TokenKind::Lt => Some(BinaryOp::Lt),
        TokenKind::Lte => Some(BinaryOp::Lte),
        TokenKind::Gt => Some(BinaryOp::Gt),
        TokenKind::Gte => Some(BinaryOp::Gte),
        TokenKind::RegexMatch => Some(BinaryOp::RegexMatch),
        _ => None,
    };

    if let Some(op) = op {
        p.advance();
        let right = parse_string_op(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }

    Ok(left)
}

fn parse_string_op(p: &mut Parser) -> Result<Expr> {
    let left = parse_addition(p)?;

    if p.at(TokenKind::Starts) {
        p.advance();
        p.expect(TokenKind::With)?;
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp {
            left: Box::new(left),
            op: StringOp::StartsWith,
            right: Box::new(right),
        });
    }
    if p.at(TokenKind::Ends) {
        p.advance();
        p.expect(TokenKind::With)?;
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp {
            left: Box::new(left),
            op: StringOp::EndsWith,
            right: Box::new(right),
        });
    }
    if p.at(TokenKind::Contains) {
        p.advance();
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp {
            left: Box::new(left),
            op: StringOp::Contains,
            right: Box::new(right),
        });
    }

    Ok(left)
}

fn parse_addition(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_multiplication(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus | TokenKind::Dash => BinaryOp::Sub,
            _ => break,
        };
        p.advance();
        let right = parse_multiplication(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_multiplication(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_power(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Mod,
            _ => break,
        };
        p.advance();
        let right = parse_power(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_power(p: &mut Parser) -> Result<Expr> {
    let left = parse_unary(p)?;
    if p.eat(TokenKind::Caret) {
        let right = parse_power(p)?; // right-associative
        Ok(Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Pow, right: Box::new(right) })
    } else {
        Ok(left)
    }
}

fn parse_unary(p: &mut Parser) -> Result<Expr> {
    if p.at(TokenKind::Minus) || p.at(TokenKind::Dash) {
        p.advance();
        let expr = parse_postfix(p)?;
        Ok(Expr::UnaryOp { op: UnaryOp::Negate, expr: Box::new(expr) })
    } else {
        parse_postfix(p)
    }
}

/// Postfix chain: property access, index access, label predicate.
fn parse_postfix(p: &mut Parser) -> Result<Expr> {
    let mut expr = parse_primary(p)?;

    loop {
        if p.at(TokenKind::Dot) {
            p.advance();
            let key = p.expect_name()?;
            expr = Expr::Property { expr: Box::new(expr), key };
        } else if p.at(TokenKind::LBracket) {
            p.advance();
            let index = parse_expr(p)?;
            p.expect(TokenKind::RBracket)?;
            expr = Expr::Index { expr: Box::new(expr), index: Box::new(index) };
        } else {
            break;
        }
    }

    // Label predicate: `n:Person` (only meaningful on a variable).
    if p.at(TokenKind::Colon) {
        if let Expr::Variable(_) = &expr {
            while p.at(TokenKind::Colon) {
                p.advance();
                let label = p.expect_name()?;
                expr = Expr::HasLabel { expr: Box::new(expr), label };
            }
        }
    }

    Ok(expr)
}

fn parse_primary(p: &mut Parser) -> Result<Expr> {
    match p.peek_kind() {
        TokenKind::Integer => {
            let tok = p.advance();
            let val = tok.text.parse::<i64>().map_err(|_| Error::SyntaxError {
                position: tok.span.start,
                message: "Invalid integer".into(),
            })?;
            Ok(Expr::Literal(Literal::Int(val)))
        }
        TokenKind::Float => {
            let tok = p.advance();
            let val = tok.text.parse::<f64>().map_err(|_| Error::SyntaxError {
                position: tok.span.start,
                message: "Invalid float".into(),
            })?;
            Ok(Expr::Literal(Literal::Float(val)))
        }
        TokenKind::StringLiteral => {
            let tok = p.advance();
            Ok(Expr::Literal(Literal::String(tok.text.clone())))
        }
        TokenKind::True => {
            p.advance();
            Ok(Expr::Literal(Literal::Bool(true)))
        }
        TokenKind::False => {
            p.advance();
            Ok(Expr::Literal(Literal::Bool(false)))
        }
        TokenKind::Null => {
            p.advance();
            Ok(Expr::Literal(Literal::Null))
        }

        TokenKind::Parameter => {
            let tok = p.advance();
            Ok(Expr::Parameter(tok.text.clone()))
        }

        TokenKind::Star => {
            p.advance();
            Ok(Expr::Star)
        }

        TokenKind::LParen => {
            p.advance();
            let expr = parse_expr(p)?;
            p.expect(TokenKind::RParen)?;
            Ok(expr)
        }

        TokenKind::LBracket => {
            p.advance();
            let mut items = Vec::new();
            if !p.at(TokenKind::RBracket) {
                items.push(parse_expr(p)?);
                while p.eat(TokenKind::Comma) {
                    items.push(parse_expr(p)?);
                }
            }
            p.expect(TokenKind::RBracket)?;
            Ok(Expr::List(items))
        }

        TokenKind::LBrace => {
            let map = parse_map_literal_inner(p)?;
            Ok(Expr::MapLiteral(map))
        }

        TokenKind::Case => {
            p.advance();
            let operand = if !p.at(TokenKind::When) {
                Some(Box::new(parse_expr(p)?))
            } else {
                None
            };
            let mut whens = Vec::new();
            while p.eat(TokenKind::When) {
                let when_expr = parse_expr(p)?;
                p.expect(TokenKind::Then)?;
                let then_expr = parse_expr(p)?;
                whens.push((when_expr, then_expr));
            }
            let else_expr = if p.eat(TokenKind::Else) {
                Some(Box::new(parse_expr(p)?))
            } else {
                None
            };
            p.expect(TokenKind::End)?;
            Ok(Expr::Case { operand, whens, else_expr })
        }

        // EXISTS { pattern [WHERE expr] } is a sub-pattern predicate;
        // EXISTS(expr) is the legacy property-existence function.
        TokenKind::Exists => {
            p.advance();
            if p.eat(TokenKind::LBrace) {
                p.eat(TokenKind::Match); // EXISTS { MATCH ... } is also legal
                let patterns = parse_pattern_list(p)?;
                let where_clause = if p.eat(TokenKind::Where) {
                    Some(Box::new(parse_expr(p)?))
                } else {
                    None
                };
                p.expect(TokenKind::RBrace)?;
                Ok(Expr::Exists { patterns, where_clause })
            } else {
                p.expect(TokenKind::LParen)?;
                let inner = parse_expr(p)?;
                p.expect(TokenKind::RParen)?;
                Ok(Expr::FunctionCall {
                    name: "exists".into(),
                    args: vec![inner],
                    distinct: false,
                })
            }
        }

        // Identifier (or soft keyword): variable or function call.
        kind if kind.is_wordlike() => {
            let tok = p.advance().clone();
            let mut name = tok.text;
            // Dotted function names: vector.similarity.cosine(...)
            while p.at(TokenKind::Dot)
                && p.peek_ahead(1).is_wordlike()
                && dotted_call_follows(p)
            {
                p.advance();
                let part = p.expect_name()?;
                name = format!("{name}.{part}");
            }
            if p.at(TokenKind::LParen) {
                p.advance();
                let mut args = Vec::new();
                let distinct = p.eat(TokenKind::Distinct);
                if p.at(TokenKind::Star) {
                    // count(*)
                    p.advance();
                } else if !p.at(TokenKind::RParen) {
                    args.push(parse_expr(p)?);
                    while p.eat(TokenKind::Comma) {
                        args.push(parse_expr(p)?);
                    }
                }
                p.expect(TokenKind::RParen)?;
                Ok(Expr::FunctionCall { name, args, distinct })
            } else if name.contains('.') {
                Err(p.error(format!("Expected '(' after '{name}'")))
            } else {
                Ok(Expr::Variable(name))
            }
        }

        _ => Err(p.error(format!(
            "Unexpected token in expression: {:?} '{}'",
            p.peek_kind(),
            p.peek().text
        ))),
    }
}

/// Distinguish `a.b.c(...)` (dotted function) from `a.b` (property access):
/// scan ahead over `.name` pairs and check for a '('.
fn dotted_call_follows(p: &Parser) -> bool {
    let mut i = 0;
    loop {
        if p.peek_ahead(i) != TokenKind::Dot || !p.peek_ahead(i + 1).is_wordlike() {
            return false;
        }
        i += 2;
        match p.peek_ahead(i) {
            TokenKind::LParen => return true,
            TokenKind::Dot => continue,
            _ => return false,
        }
    }
}

fn parse_map_literal_inner(p: &mut Parser) -> Result<HashMap<String, Expr>> {
    p.expect(TokenKind::LBrace)?;
    let mut map = HashMap::new();
    if !p.at(TokenKind::RBrace) {
        loop {
            let key = p.expect_name()?;
            p.expect(TokenKind::Colon)?;
            let value = parse_expr(p)?;
            map.insert(key, value);
            if !p.eat(TokenKind::Comma) {
                break;
            }
        }
    }
    p.expect(TokenKind::RBrace)?;
    Ok(map)
}

// ============================================================================
// Tests
// ============================================================================
