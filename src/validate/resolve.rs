use sqlparser::ast::{
    AssignmentTarget, Expr, FromTable, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
    GroupByExpr, Ident, JoinConstraint, JoinOperator, NamedWindowExpr, ObjectName, OrderByExpr,
    Query, Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins,
    WindowSpec, WindowType,
};

use crate::schema::StructuredSchema;

/// Columns every row carries without being declared.
const PSEUDO_COLUMNS: &[&str] = &["rowid", "oid", "_rowid_"];

/// Resolve every table and column reference in `statement`. Returns one
/// message per distinct unresolved name, in the order they were found.
pub(super) fn resolve_statement(statement: &Statement, schema: &StructuredSchema) -> Vec<String> {
    let mut resolver = Resolver {
        schema,
        errors: Vec::new(),
    };
    resolver.statement(statement);
    resolver.errors
}

#[derive(Debug, Clone)]
enum Columns {
    Known(Vec<String>),
    /// Anything resolves: table functions, VALUES lists, failed lookups.
    Open,
}

impl Columns {
    fn contains(&self, name: &str) -> bool {
        match self {
            Columns::Known(columns) => columns.iter().any(|c| c.eq_ignore_ascii_case(name)),
            Columns::Open => true,
        }
    }
}

#[derive(Debug)]
struct Relation {
    name: Option<String>,
    columns: Columns,
    /// Answers to any qualifier.
    wildcard: bool,
}

impl Relation {
    fn new(name: Option<String>, columns: Columns) -> Self {
        Self {
            name,
            columns,
            wildcard: false,
        }
    }

    fn wildcard() -> Self {
        Self {
            name: None,
            columns: Columns::Open,
            wildcard: true,
        }
    }

    fn is_named(&self, qualifier: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(qualifier))
    }
}

/// Names visible at one level of a query. Lookups that miss fall through to
/// the enclosing level, which is what makes correlated subqueries resolve.
#[derive(Debug, Default)]
struct Scope<'p> {
    parent: Option<&'p Scope<'p>>,
    ctes: Vec<(String, Columns)>,
    relations: Vec<Relation>,
    aliases: Vec<String>,
}

impl<'p> Scope<'p> {
    fn child(&self) -> Scope<'_> {
        Scope {
            parent: Some(self),
            ..Scope::default()
        }
    }

    fn find_cte(&self, name: &str) -> Option<&Columns> {
        self.ctes
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, columns)| columns)
            .or_else(|| self.parent.and_then(|p| p.find_cte(name)))
    }

    fn resolves(&self, column: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(column))
            || self.relations.iter().any(|r| r.columns.contains(column))
            || self.parent.is_some_and(|p| p.resolves(column))
    }

    fn find_relation(&self, qualifier: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.is_named(qualifier))
            .or_else(|| self.relations.iter().find(|r| r.wildcard))
            .or_else(|| self.parent.and_then(|p| p.find_relation(qualifier)))
    }
}

struct Resolver<'s> {
    schema: &'s StructuredSchema,
    errors: Vec<String>,
}

impl<'s> Resolver<'s> {
    fn error(&mut self, message: String) {
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }

    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Query(query) => {
                self.query(query, &Scope::default());
            }
            Statement::Insert(insert) => {
                let mut scope = Scope::default();
                let target = self.named_table(&insert.table_name, None, &scope);
                for column in &insert.columns {
                    self.target_column(&target, &column.value);
                }
                if let Some(source) = &insert.source {
                    self.query(source, &Scope::default());
                }
                scope.relations.push(target);
                if let Some(returning) = &insert.returning {
                    self.projection(returning, &scope);
                }
            }
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                returning,
                ..
            } => {
                let mut scope = Scope::default();
                self.table_with_joins(table, &mut scope);
                // Relations joined in through FROM are not tracked; accept
                // whatever they are asked for.
                if from.is_some() {
                    scope.relations.push(Relation::wildcard());
                }
                for assignment in assignments {
                    let targets: Vec<&ObjectName> = match &assignment.target {
                        AssignmentTarget::ColumnName(name) => vec![name],
                        AssignmentTarget::Tuple(names) => names.iter().collect(),
                    };
                    if let Some(target) = scope.relations.first() {
                        for column in targets.iter().filter_map(|name| name.0.last()) {
                            self.target_column(target, &column.value);
                        }
                    }
                    self.expr(&assignment.value, &scope);
                }
                if let Some(selection) = selection {
                    self.expr(selection, &scope);
                }
                if let Some(returning) = returning {
                    self.projection(returning, &scope);
                }
            }
            Statement::Delete(delete) => {
                let mut scope = Scope::default();
                let tables = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
                };
                for table in tables {
                    self.table_with_joins(table, &mut scope);
                }
                for table in delete.using.iter().flatten() {
                    self.table_with_joins(table, &mut scope);
                }
                if let Some(selection) = &delete.selection {
                    self.expr(selection, &scope);
                }
                if let Some(returning) = &delete.returning {
                    self.projection(returning, &scope);
                }
            }
            Statement::Explain { statement, .. } => self.statement(statement),
            _ => {}
        }
    }

    fn target_column(&mut self, target: &Relation, column: &str) {
        if !target.columns.contains(column) && !is_pseudo_column(column) {
            let table = target.name.clone().unwrap_or_default();
            self.error(unresolved_in(column, &table));
        }
    }

    fn query(&mut self, query: &Query, scope: &Scope<'_>) -> Columns {
        let mut local = scope.child();

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.clone();
                let declared = alias_columns(&cte.alias);
                if with.recursive {
                    let placeholder = declared.clone().map_or(Columns::Open, Columns::Known);
                    local.ctes.push((name.clone(), placeholder));
                }
                let derived = self.query(&cte.query, &local);
                let columns = declared.map_or(derived, Columns::Known);
                if with.recursive {
                    local.ctes.pop();
                }
                local.ctes.push((name, columns));
            }
        }

        let order_by: &[OrderByExpr] = query
            .order_by
            .as_ref()
            .map(|o| o.exprs.as_slice())
            .unwrap_or(&[]);
        let columns = self.set_expr(&query.body, order_by, &local);

        if let Some(limit) = &query.limit {
            self.expr(limit, &local);
        }
        if let Some(offset) = &query.offset {
            self.expr(&offset.value, &local);
        }
        columns
    }

    fn set_expr(&mut self, body: &SetExpr, order_by: &[OrderByExpr], scope: &Scope<'_>) -> Columns {
        match body {
            SetExpr::Select(select) => self.select(select, order_by, scope),
            SetExpr::Query(query) => {
                let columns = self.query(query, scope);
                self.order_by_output(order_by, &columns, scope);
                columns
            }
            SetExpr::SetOperation { left, right, .. } => {
                let columns = self.set_expr(left, &[], scope);
                self.set_expr(right, &[], scope);
                self.order_by_output(order_by, &columns, scope);
                columns
            }
            SetExpr::Values(values) => {
                for row in &values.rows {
                    for expr in row {
                        self.expr(expr, scope);
                    }
                }
                Columns::Open
            }
            _ => Columns::Open,
        }
    }

    /// ORDER BY over a compound query sees only the output columns.
    fn order_by_output(&mut self, order_by: &[OrderByExpr], columns: &Columns, scope: &Scope<'_>) {
        if order_by.is_empty() {
            return;
        }
        let mut output = scope.child();
        output
            .relations
            .push(Relation::new(None, columns.clone()));
        for item in order_by {
            self.expr(&item.expr, &output);
        }
    }

    fn select(&mut self, select: &Select, order_by: &[OrderByExpr], scope: &Scope<'_>) -> Columns {
        let mut local = scope.child();
        for table in &select.from {
            self.table_with_joins(table, &mut local);
        }

        let (columns, aliases) = self.projection(&select.projection, &local);
        local.aliases = aliases;

        if let Some(selection) = &select.selection {
            self.expr(selection, &local);
        }
        if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
            for expr in exprs {
                self.expr(expr, &local);
            }
        }
        if let Some(having) = &select.having {
            self.expr(having, &local);
        }
        if let Some(qualify) = &select.qualify {
            self.expr(qualify, &local);
        }
        for window in &select.named_window {
            if let NamedWindowExpr::WindowSpec(spec) = &window.1 {
                self.window_spec(spec, &local);
            }
        }
        for item in order_by {
            self.expr(&item.expr, &local);
        }
        columns
    }

    /// Walk select items; returns the output columns and any aliases.
    fn projection(&mut self, items: &[SelectItem], scope: &Scope<'_>) -> (Columns, Vec<String>) {
        let mut names = Vec::new();
        let mut aliases = Vec::new();
        let mut open = false;

        for item in items {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    self.expr(expr, scope);
                    names.push(output_name(expr));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.expr(expr, scope);
                    names.push(alias.value.clone());
                    aliases.push(alias.value.clone());
                }
                SelectItem::Wildcard(_) => {
                    for relation in &scope.relations {
                        match &relation.columns {
                            Columns::Known(columns) => names.extend(columns.iter().cloned()),
                            Columns::Open => open = true,
                        }
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let Some(qualifier) = name.0.last() else {
                        continue;
                    };
                    match scope.find_relation(&qualifier.value).map(|r| &r.columns) {
                        Some(Columns::Known(columns)) => names.extend(columns.iter().cloned()),
                        Some(Columns::Open) => open = true,
                        None => {
                            self.error(unresolved_table(&qualifier.value));
                            open = true;
                        }
                    }
                }
            }
        }

        let columns = if open {
            Columns::Open
        } else {
            Columns::Known(names)
        };
        (columns, aliases)
    }

    fn table_with_joins(&mut self, table: &TableWithJoins, scope: &mut Scope<'_>) {
        self.table_factor(&table.relation, scope);
        for join in &table.joins {
            self.table_factor(&join.relation, scope);
            let constraint = match &join.join_operator {
                JoinOperator::Inner(c)
                | JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => Some(c),
                _ => None,
            };
            match constraint {
                Some(JoinConstraint::On(expr)) => self.expr(expr, scope),
                Some(JoinConstraint::Using(columns)) => {
                    for column in columns {
                        self.using_column(&column.value, scope);
                    }
                }
                _ => {}
            }
        }
    }

    /// A USING column must exist on the joined relation and on at least one
    /// relation to its left.
    fn using_column(&mut self, column: &str, scope: &Scope<'_>) {
        let Some((joined, earlier)) = scope.relations.split_last() else {
            return;
        };
        if !joined.columns.contains(column) || !earlier.iter().any(|r| r.columns.contains(column)) {
            self.error(unresolved(column));
        }
    }

    fn table_factor(&mut self, factor: &TableFactor, scope: &mut Scope<'_>) {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                let relation = if args.is_some() {
                    let name = alias
                        .as_ref()
                        .map(|a| a.name.value.clone())
                        .or_else(|| name.0.last().map(|i| i.value.clone()));
                    Relation::new(name, Columns::Open)
                } else {
                    self.named_table(name, alias.as_ref(), scope)
                };
                scope.relations.push(relation);
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
                ..
            } => {
                let derived = match (*lateral, scope.parent) {
                    (true, _) => self.query(subquery, scope),
                    (false, Some(parent)) => self.query(subquery, parent),
                    (false, None) => self.query(subquery, &Scope::default()),
                };
                let columns = alias
                    .as_ref()
                    .and_then(alias_columns)
                    .map_or(derived, Columns::Known);
                let name = alias.as_ref().map(|a| a.name.value.clone());
                scope.relations.push(Relation::new(name, columns));
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.table_with_joins(table_with_joins, scope),
            _ => scope.relations.push(Relation::wildcard()),
        }
    }

    fn named_table(
        &mut self,
        name: &ObjectName,
        alias: Option<&TableAlias>,
        scope: &Scope<'_>,
    ) -> Relation {
        let parts: Vec<&str> = name.0.iter().map(|i| i.value.as_str()).collect();
        let table = parts.last().copied().unwrap_or_default();
        let relation_name = alias
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| table.to_string());

        let cte = match parts.len() {
            1 => scope.find_cte(table).cloned(),
            _ => None,
        };
        let columns = match cte {
            Some(columns) => columns,
            None => match self.schema.table(table) {
                Some(t) => Columns::Known(t.column_names().map(str::to_string).collect()),
                None if is_system_relation(&parts) => Columns::Open,
                None => {
                    self.error(unresolved_table(&parts.join(".")));
                    Columns::Open
                }
            },
        };
        let columns = alias.and_then(alias_columns).map_or(columns, Columns::Known);
        Relation::new(Some(relation_name), columns)
    }

    fn column(&mut self, qualifier: Option<&Ident>, column: &Ident, scope: &Scope<'_>) {
        if is_pseudo_column(&column.value) {
            return;
        }
        match qualifier {
            None => {
                if !scope.resolves(&column.value) {
                    self.error(unresolved(&column.value));
                }
            }
            Some(qualifier) => match scope.find_relation(&qualifier.value) {
                None => self.error(unresolved_table(&qualifier.value)),
                Some(relation) if relation.columns.contains(&column.value) => {}
                Some(_) => self.error(unresolved_in(&column.value, &qualifier.value)),
            },
        }
    }

    fn expr(&mut self, expr: &Expr, scope: &Scope<'_>) {
        match expr {
            Expr::Identifier(ident) => self.column(None, ident, scope),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [] => {}
                [column] => self.column(None, column, scope),
                [.., table, column] => self.column(Some(table), column, scope),
            },
            Expr::BinaryOp { left, right, .. }
            | Expr::AnyOp { left, right, .. }
            | Expr::AllOp { left, right, .. } => {
                self.expr(left, scope);
                self.expr(right, scope);
            }
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.expr(left, scope);
                self.expr(right, scope);
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotFalse(expr)
            | Expr::IsUnknown(expr)
            | Expr::IsNotUnknown(expr)
            | Expr::Cast { expr, .. }
            | Expr::Collate { expr, .. }
            | Expr::Extract { expr, .. }
            | Expr::Ceil { expr, .. }
            | Expr::Floor { expr, .. }
            | Expr::CompositeAccess { expr, .. } => self.expr(expr, scope),
            Expr::JsonAccess { value, .. } => self.expr(value, scope),
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.expr(expr, scope);
                self.expr(pattern, scope);
            }
            Expr::InList { expr, list, .. } => {
                self.expr(expr, scope);
                for item in list {
                    self.expr(item, scope);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr, scope);
                self.query(subquery, scope);
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.expr(expr, scope);
                self.expr(low, scope);
                self.expr(high, scope);
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.expr(operand, scope);
                }
                for e in conditions.iter().chain(results) {
                    self.expr(e, scope);
                }
                if let Some(else_result) = else_result {
                    self.expr(else_result, scope);
                }
            }
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => {
                self.query(query, scope);
            }
            Expr::Function(function) => self.function(function, scope),
            Expr::Position { expr, r#in } => {
                self.expr(expr, scope);
                self.expr(r#in, scope);
            }
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                self.expr(expr, scope);
                for e in substring_from.iter().chain(substring_for) {
                    self.expr(e, scope);
                }
            }
            Expr::Trim {
                expr, trim_what, ..
            } => {
                self.expr(expr, scope);
                if let Some(what) = trim_what {
                    self.expr(what, scope);
                }
            }
            Expr::AtTimeZone {
                timestamp,
                time_zone,
            } => {
                self.expr(timestamp, scope);
                self.expr(time_zone, scope);
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.expr(item, scope);
                }
            }
            Expr::Array(array) => {
                for item in &array.elem {
                    self.expr(item, scope);
                }
            }
            Expr::Interval(interval) => self.expr(&interval.value, scope),
            Expr::GroupingSets(sets) | Expr::Cube(sets) | Expr::Rollup(sets) => {
                for e in sets.iter().flatten() {
                    self.expr(e, scope);
                }
            }
            _ => {}
        }
    }

    fn function(&mut self, function: &Function, scope: &Scope<'_>) {
        match &function.args {
            FunctionArguments::List(list) => {
                for arg in &list.args {
                    let arg = match arg {
                        FunctionArg::Unnamed(arg) | FunctionArg::Named { arg, .. } => arg,
                        _ => continue,
                    };
                    if let FunctionArgExpr::Expr(expr) = arg {
                        self.expr(expr, scope);
                    }
                }
            }
            FunctionArguments::Subquery(query) => {
                self.query(query, scope);
            }
            FunctionArguments::None => {}
        }
        if let Some(filter) = &function.filter {
            self.expr(filter, scope);
        }
        for item in &function.within_group {
            self.expr(&item.expr, scope);
        }
        if let Some(WindowType::WindowSpec(spec)) = &function.over {
            self.window_spec(spec, scope);
        }
    }

    fn window_spec(&mut self, spec: &WindowSpec, scope: &Scope<'_>) {
        for expr in &spec.partition_by {
            self.expr(expr, scope);
        }
        for item in &spec.order_by {
            self.expr(&item.expr, scope);
        }
    }
}

fn alias_columns(alias: &TableAlias) -> Option<Vec<String>> {
    if alias.columns.is_empty() {
        None
    } else {
        Some(alias.columns.iter().map(|c| c.name.value.clone()).collect())
    }
}

/// Name a projection item gets in a derived table when it has no alias.
fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        Expr::Function(function) => function
            .name
            .0
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => output_name(expr),
        other => other.to_string(),
    }
}

fn is_pseudo_column(name: &str) -> bool {
    PSEUDO_COLUMNS.iter().any(|p| p.eq_ignore_ascii_case(name))
}

/// Catalog relations that never appear in extracted DDL.
fn is_system_relation(parts: &[&str]) -> bool {
    match parts {
        [schema, _] => {
            schema.eq_ignore_ascii_case("information_schema")
                || schema.eq_ignore_ascii_case("pg_catalog")
        }
        [table] => {
            let table = table.to_ascii_lowercase();
            table.starts_with("pg_") || table.starts_with("sqlite_")
        }
        _ => false,
    }
}

fn unresolved(column: &str) -> String {
    format!("Column '{}' could not be resolved", column)
}

fn unresolved_in(column: &str, table: &str) -> String {
    format!("Column '{}' could not be resolved for table: '{}'", column, table)
}

fn unresolved_table(table: &str) -> String {
    format!("Table '{}' could not be resolved", table)
}
