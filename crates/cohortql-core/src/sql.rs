//! A small dialect-neutral SQL model and its deterministic text rendering.
//!
//! The lowering stage builds [`SelectQuery`] values out of [`SqlExpr`] trees;
//! nothing here knows about query nodes or catalogs. Rendering is plain
//! string assembly: identifiers are emitted bare (every name the compiler
//! mints is `[a-z0-9_]`-safe, and identifier quoting is where SQL dialects
//! genuinely diverge), composite expressions are parenthesized, and the only
//! dialect knob is how boolean literals are spelled.

use std::fmt::Write;

use crate::query::Literal;

/// Rendering knobs supplied by the dialect.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// How a boolean TRUE literal is spelled (`TRUE`, or `1` on MSSQL).
    pub true_literal: &'static str,
    /// How a boolean FALSE literal is spelled.
    pub false_literal: &'static str,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            true_literal: "TRUE",
            false_literal: "FALSE",
        }
    }
}

/// Binary operators appearing in lowered expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Minus,
    Divide,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Minus => "-",
            BinaryOp::Divide => "/",
        }
    }
}

/// One term of a window ORDER BY.
#[derive(Debug, Clone)]
pub struct OrderTerm {
    pub expr: SqlExpr,
    pub descending: bool,
}

/// A SQL scalar or boolean expression.
#[derive(Debug, Clone)]
pub enum SqlExpr {
    /// `table.column`
    Column { table: String, column: String },
    Literal(Literal),
    /// A bare keyword argument such as the `YEAR` in `DATEDIFF(YEAR, a, b)`.
    Keyword(&'static str),
    Binary {
        op: BinaryOp,
        lhs: Box<SqlExpr>,
        rhs: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    IsNull(Box<SqlExpr>),
    /// `expr [NOT] IN (subquery)`
    InSubquery {
        expr: Box<SqlExpr>,
        subquery: Box<SelectQuery>,
        negated: bool,
    },
    /// `(subquery)` used as a scalar value.
    ScalarSubquery(Box<SelectQuery>),
    Function {
        name: &'static str,
        args: Vec<SqlExpr>,
    },
    Cast {
        expr: Box<SqlExpr>,
        type_name: &'static str,
    },
    /// `ROW_NUMBER() OVER (PARTITION BY .. ORDER BY ..)`
    RowNumber {
        partition_by: Box<SqlExpr>,
        order_by: Vec<OrderTerm>,
    },
    /// `CASE WHEN .. THEN .. [WHEN ..] ELSE .. END`
    Case {
        branches: Vec<(SqlExpr, SqlExpr)>,
        default: Box<SqlExpr>,
    },
}

impl SqlExpr {
    pub fn col(table: impl Into<String>, column: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn lit(value: impl Into<Literal>) -> SqlExpr {
        SqlExpr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, lhs: SqlExpr, rhs: SqlExpr) -> SqlExpr {
        SqlExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn and(lhs: SqlExpr, rhs: SqlExpr) -> SqlExpr {
        SqlExpr::binary(BinaryOp::And, lhs, rhs)
    }

    pub fn or(lhs: SqlExpr, rhs: SqlExpr) -> SqlExpr {
        SqlExpr::binary(BinaryOp::Or, lhs, rhs)
    }

    pub fn is_null(expr: SqlExpr) -> SqlExpr {
        SqlExpr::IsNull(Box::new(expr))
    }

    pub fn func(name: &'static str, args: Vec<SqlExpr>) -> SqlExpr {
        SqlExpr::Function { name, args }
    }

    pub fn cast(expr: SqlExpr, type_name: &'static str) -> SqlExpr {
        SqlExpr::Cast {
            expr: Box::new(expr),
            type_name,
        }
    }

    fn write(&self, out: &mut String, opts: &RenderOptions) {
        match self {
            SqlExpr::Column { table, column } => {
                let _ = write!(out, "{table}.{column}");
            }
            SqlExpr::Literal(literal) => write_literal(out, literal, opts),
            SqlExpr::Keyword(kw) => out.push_str(kw),
            SqlExpr::Binary { op, lhs, rhs } => {
                out.push('(');
                lhs.write(out, opts);
                let _ = write!(out, " {} ", op.symbol());
                rhs.write(out, opts);
                out.push(')');
            }
            SqlExpr::Not(inner) => {
                out.push_str("NOT ");
                match inner.as_ref() {
                    SqlExpr::Binary { .. } | SqlExpr::InSubquery { .. } => {
                        inner.write(out, opts);
                    }
                    other => {
                        out.push('(');
                        other.write(out, opts);
                        out.push(')');
                    }
                }
            }
            SqlExpr::IsNull(inner) => {
                inner.write(out, opts);
                out.push_str(" IS NULL");
            }
            SqlExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                out.push('(');
                expr.write(out, opts);
                out.push_str(if *negated { " NOT IN (" } else { " IN (" });
                subquery.write(out, opts);
                out.push_str("))");
            }
            SqlExpr::ScalarSubquery(subquery) => {
                out.push('(');
                subquery.write(out, opts);
                out.push(')');
            }
            SqlExpr::Function { name, args } => {
                let _ = write!(out, "{name}(");
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.write(out, opts);
                }
                out.push(')');
            }
            SqlExpr::Cast { expr, type_name } => {
                out.push_str("CAST(");
                expr.write(out, opts);
                let _ = write!(out, " AS {type_name})");
            }
            SqlExpr::RowNumber {
                partition_by,
                order_by,
            } => {
                out.push_str("ROW_NUMBER() OVER (PARTITION BY ");
                partition_by.write(out, opts);
                out.push_str(" ORDER BY ");
                for (i, term) in order_by.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    term.expr.write(out, opts);
                    if term.descending {
                        out.push_str(" DESC");
                    }
                }
                out.push(')');
            }
            SqlExpr::Case { branches, default } => {
                out.push_str("CASE");
                for (condition, value) in branches {
                    out.push_str(" WHEN ");
                    condition.write(out, opts);
                    out.push_str(" THEN ");
                    value.write(out, opts);
                }
                out.push_str(" ELSE ");
                default.write(out, opts);
                out.push_str(" END");
            }
        }
    }

    pub fn to_sql(&self, opts: &RenderOptions) -> String {
        let mut out = String::new();
        self.write(&mut out, opts);
        out
    }
}

fn write_literal(out: &mut String, literal: &Literal, opts: &RenderOptions) {
    match literal {
        Literal::Null => out.push_str("NULL"),
        Literal::Bool(true) => out.push_str(opts.true_literal),
        Literal::Bool(false) => out.push_str(opts.false_literal),
        Literal::Integer(v) => {
            let _ = write!(out, "{v}");
        }
        Literal::Float(v) => {
            let _ = write!(out, "{v}");
        }
        Literal::String(v) => {
            let _ = write!(out, "'{}'", v.replace('\'', "''"));
        }
        Literal::Date(v) => {
            let _ = write!(out, "'{}'", v.format("%Y-%m-%d"));
        }
    }
}

/// A table-valued term in a FROM clause or join.
#[derive(Debug, Clone)]
pub enum TableFactor {
    /// A bare table reference: interim and codelist tables.
    Named { name: String },
    /// A verbatim SQL subquery from the backend catalog.
    Derived { sql: String, alias: String },
    /// A physical table with per-column renames, projected and aliased.
    Projected {
        source: String,
        /// `(physical_column, exposed_name)` pairs, in declaration order.
        columns: Vec<(String, String)>,
        alias: String,
    },
    /// A lowered subquery, used to wrap row-picker windowing.
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
}

impl TableFactor {
    /// The name other expressions use to qualify this factor's columns.
    pub fn reference_name(&self) -> &str {
        match self {
            TableFactor::Named { name } => name,
            TableFactor::Derived { alias, .. } => alias,
            TableFactor::Projected { alias, .. } => alias,
            TableFactor::Subquery { alias, .. } => alias,
        }
    }

    fn write(&self, out: &mut String, opts: &RenderOptions) {
        match self {
            TableFactor::Named { name } => out.push_str(name),
            TableFactor::Derived { sql, alias } => {
                let _ = write!(out, "({}) AS {alias}", sql.trim());
            }
            TableFactor::Projected {
                source,
                columns,
                alias,
            } => {
                out.push_str("(SELECT ");
                for (i, (physical, exposed)) in columns.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if physical == exposed {
                        out.push_str(exposed);
                    } else {
                        let _ = write!(out, "{physical} AS {exposed}");
                    }
                }
                let _ = write!(out, " FROM {source}) AS {alias}");
            }
            TableFactor::Subquery { query, alias } => {
                out.push('(');
                query.write(out, opts);
                let _ = write!(out, ") AS {alias}");
            }
        }
    }
}

/// A join onto a [`SelectQuery`]'s FROM clause.
#[derive(Debug, Clone)]
pub struct Join {
    pub factor: TableFactor,
    pub on: SqlExpr,
    pub left_outer: bool,
}

/// One projected column of a [`SelectQuery`].
#[derive(Debug, Clone)]
pub struct SelectColumn {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

impl SelectColumn {
    pub fn plain(expr: SqlExpr) -> Self {
        SelectColumn { expr, alias: None }
    }

    pub fn aliased(expr: SqlExpr, alias: impl Into<String>) -> Self {
        SelectColumn {
            expr,
            alias: Some(alias.into()),
        }
    }
}

/// A dialect-neutral SELECT statement.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub columns: Vec<SelectColumn>,
    pub from: TableFactor,
    pub joins: Vec<Join>,
    /// Conjoined into the WHERE clause.
    pub predicates: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
}

impl SelectQuery {
    pub fn new(from: TableFactor) -> Self {
        SelectQuery {
            columns: Vec::new(),
            from,
            joins: Vec::new(),
            predicates: Vec::new(),
            group_by: Vec::new(),
        }
    }

    /// True if a factor with this reference name is already in the FROM
    /// clause, either as the base or as a join.
    pub fn references_table(&self, name: &str) -> bool {
        self.from.reference_name() == name
            || self.joins.iter().any(|j| j.factor.reference_name() == name)
    }

    fn write(&self, out: &mut String, opts: &RenderOptions) {
        out.push_str("SELECT ");
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            column.expr.write(out, opts);
            if let Some(alias) = &column.alias {
                let _ = write!(out, " AS {alias}");
            }
        }
        out.push_str(" FROM ");
        self.from.write(out, opts);
        for join in &self.joins {
            out.push_str(if join.left_outer {
                " LEFT OUTER JOIN "
            } else {
                " JOIN "
            });
            join.factor.write(out, opts);
            out.push_str(" ON ");
            join.on.write(out, opts);
        }
        if !self.predicates.is_empty() {
            out.push_str(" WHERE ");
            for (i, predicate) in self.predicates.iter().enumerate() {
                if i > 0 {
                    out.push_str(" AND ");
                }
                predicate.write(out, opts);
            }
        }
        if !self.group_by.is_empty() {
            out.push_str(" GROUP BY ");
            for (i, expr) in self.group_by.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                expr.write(out, opts);
            }
        }
    }

    pub fn to_sql(&self, opts: &RenderOptions) -> String {
        let mut out = String::new();
        self.write(&mut out, opts);
        out
    }
}
