//! Static analysis of cell source using syn.
//!
//! A cell body is parsed as a Rust statement block. Top-level bindings become
//! the cell's definitions; free single-segment paths become its references.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;
use syn::punctuated::Punctuated;
use syn::visit::{self, Visit};
use syn::{
    Arm, Block, Expr, ExprClosure, ExprForLoop, ExprIf, ExprLet, ExprPath, ExprWhile, Item,
    Local, Macro, Pat, Stmt, Token, UseTree,
};

use super::types::CellSignature;
use crate::error::{Error, Result};

/// Names that never create a dependency.
const PRELUDE: &[&str] = &[
    "Some", "None", "Ok", "Err", "Box", "Vec", "String", "Option", "Result", "Default", "drop",
    "std", "core", "alloc", "self", "Self", "crate", "super",
];

/// Derive the reference/definition contract of a cell from its source.
pub fn analyze(source: &str) -> Result<CellSignature> {
    let block: Block = syn::parse_str(&format!("{{\n{}\n}}", source))
        .map_err(|e| Error::Parse(e.to_string()))?;

    let mut collector = RefCollector::default();
    let mut defs = Vec::new();

    // Items are visible to the whole block
    for stmt in &block.stmts {
        if let Stmt::Item(item) = stmt {
            item_names(item, &mut defs);
        }
    }
    collector.scopes.push(defs.iter().cloned().collect());

    for stmt in &block.stmts {
        match stmt {
            Stmt::Local(local) => {
                collector.visit_local(local);
                bind_pattern(&local.pat, &mut defs);
            }
            Stmt::Item(item) => collector.visit_top_level_item(item),
            Stmt::Expr(..) | Stmt::Macro(_) => collector.visit_stmt(stmt),
        }
    }

    let refs = collector
        .refs
        .into_iter()
        .filter(|name| !PRELUDE.contains(&name.as_str()));

    Ok(CellSignature::normalized(refs, defs))
}

/// Collect the names bound by a pattern.
fn bind_pattern(pat: &Pat, out: &mut Vec<String>) {
    match pat {
        Pat::Ident(p) => {
            out.push(p.ident.to_string());
            if let Some((_, sub)) = &p.subpat {
                bind_pattern(sub, out);
            }
        }
        Pat::Tuple(t) => t.elems.iter().for_each(|p| bind_pattern(p, out)),
        Pat::TupleStruct(t) => t.elems.iter().for_each(|p| bind_pattern(p, out)),
        Pat::Struct(s) => s.fields.iter().for_each(|f| bind_pattern(&f.pat, out)),
        Pat::Slice(s) => s.elems.iter().for_each(|p| bind_pattern(p, out)),
        Pat::Or(o) => o.cases.iter().for_each(|p| bind_pattern(p, out)),
        Pat::Reference(r) => bind_pattern(&r.pat, out),
        Pat::Type(t) => bind_pattern(&t.pat, out),
        Pat::Paren(p) => bind_pattern(&p.pat, out),
        _ => {}
    }
}

/// Names introduced by a top-level item.
fn item_names(item: &Item, out: &mut Vec<String>) {
    match item {
        Item::Fn(f) => out.push(f.sig.ident.to_string()),
        Item::Struct(s) => out.push(s.ident.to_string()),
        Item::Enum(e) => out.push(e.ident.to_string()),
        Item::Const(c) => out.push(c.ident.to_string()),
        Item::Static(s) => out.push(s.ident.to_string()),
        Item::Type(t) => out.push(t.ident.to_string()),
        Item::Trait(t) => out.push(t.ident.to_string()),
        Item::Mod(m) => out.push(m.ident.to_string()),
        Item::Use(u) => use_names(&u.tree, out),
        _ => {}
    }
}

fn use_names(tree: &UseTree, out: &mut Vec<String>) {
    match tree {
        UseTree::Path(p) => use_names(&p.tree, out),
        UseTree::Name(n) if n.ident != "self" => out.push(n.ident.to_string()),
        UseTree::Rename(r) => out.push(r.rename.to_string()),
        UseTree::Group(g) => g.items.iter().for_each(|t| use_names(t, out)),
        _ => {}
    }
}

/// Inline captures in a format string (`"{name}"`, `"{name:>8}"`).
fn format_captures(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        if let Some(stripped) = rest.strip_prefix('{') {
            rest = stripped;
            continue;
        }
        let Some(close) = rest.find('}') else {
            break;
        };
        let inner = &rest[..close];
        let name = inner.split(':').next().unwrap_or_default().trim();
        if syn::parse_str::<syn::Ident>(name).is_ok() {
            names.push(name.to_string());
        }
        rest = &rest[close + 1..];
    }

    names
}

/// Walks expressions, tracking lexical scopes, and records free names.
#[derive(Default)]
struct RefCollector {
    scopes: Vec<FxHashSet<String>>,
    refs: BTreeSet<String>,
}

impl RefCollector {
    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn bind(&mut self, pat: &Pat) {
        let mut names = Vec::new();
        bind_pattern(pat, &mut names);
        if let Some(scope) = self.scopes.last_mut() {
            scope.extend(names);
        }
    }

    fn read(&mut self, name: String) {
        if !self.is_bound(&name) {
            self.refs.insert(name);
        }
    }

    fn scoped(&mut self, f: impl FnOnce(&mut Self)) {
        self.scopes.push(FxHashSet::default());
        f(self);
        self.scopes.pop();
    }

    /// Item bodies at the top level may read other cells' names.
    fn visit_top_level_item(&mut self, item: &Item) {
        match item {
            Item::Fn(f) => self.scoped(|this| {
                for input in &f.sig.inputs {
                    if let syn::FnArg::Typed(arg) = input {
                        this.bind(&arg.pat);
                    }
                }
                this.visit_block(&f.block);
            }),
            Item::Const(c) => self.visit_expr(&c.expr),
            Item::Static(s) => self.visit_expr(&s.expr),
            _ => {}
        }
    }
}

impl<'ast> Visit<'ast> for RefCollector {
    fn visit_block(&mut self, block: &'ast Block) {
        self.scoped(|this| {
            for stmt in &block.stmts {
                this.visit_stmt(stmt);
            }
        });
    }

    fn visit_local(&mut self, local: &'ast Local) {
        if let Some(init) = &local.init {
            self.visit_expr(&init.expr);
            if let Some((_, diverge)) = &init.diverge {
                self.visit_expr(diverge);
            }
        }
        self.bind(&local.pat);
    }

    fn visit_expr_closure(&mut self, closure: &'ast ExprClosure) {
        self.scoped(|this| {
            for input in &closure.inputs {
                this.bind(input);
            }
            this.visit_expr(&closure.body);
        });
    }

    fn visit_expr_for_loop(&mut self, for_loop: &'ast ExprForLoop) {
        self.visit_expr(&for_loop.expr);
        self.scoped(|this| {
            this.bind(&for_loop.pat);
            this.visit_block(&for_loop.body);
        });
    }

    fn visit_arm(&mut self, arm: &'ast Arm) {
        self.scoped(|this| {
            this.bind(&arm.pat);
            if let Some((_, guard)) = &arm.guard {
                this.visit_expr(guard);
            }
            this.visit_expr(&arm.body);
        });
    }

    fn visit_expr_if(&mut self, expr_if: &'ast ExprIf) {
        // `if let` bindings are visible in the then-branch only
        self.scoped(|this| {
            this.visit_expr(&expr_if.cond);
            this.visit_block(&expr_if.then_branch);
        });
        if let Some((_, else_branch)) = &expr_if.else_branch {
            self.visit_expr(else_branch);
        }
    }

    fn visit_expr_while(&mut self, expr_while: &'ast ExprWhile) {
        self.scoped(|this| {
            this.visit_expr(&expr_while.cond);
            this.visit_block(&expr_while.body);
        });
    }

    fn visit_expr_let(&mut self, expr_let: &'ast ExprLet) {
        self.visit_expr(&expr_let.expr);
        self.bind(&expr_let.pat);
    }

    fn visit_expr_path(&mut self, expr_path: &'ast ExprPath) {
        let path = &expr_path.path;
        if expr_path.qself.is_none() && path.leading_colon.is_none() && path.segments.len() == 1 {
            self.read(path.segments[0].ident.to_string());
        }
        visit::visit_expr_path(self, expr_path);
    }

    fn visit_macro(&mut self, mac: &'ast Macro) {
        let Ok(args) = mac.parse_body_with(Punctuated::<Expr, Token![,]>::parse_terminated) else {
            return;
        };
        for (i, arg) in args.iter().enumerate() {
            match arg {
                Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(template),
                    ..
                }) if i == 0 => {
                    for name in format_captures(&template.value()) {
                        self.read(name);
                    }
                }
                _ => self.visit_expr(arg),
            }
        }
    }

    // Nested items cannot see the enclosing locals
    fn visit_item(&mut self, _item: &'ast Item) {}
}
