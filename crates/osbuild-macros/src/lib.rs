use proc_macro::TokenStream;

use quote::quote;
use syn::{Attribute, Expr, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser, spanned::Spanned};

/// Declares a pipeline stage on a unit struct.
///
/// ```ignore
/// #[Task(id = "disk.image", phase = "compose", default_label = "Compose GPT disk image")]
/// pub struct DiskImageTask;
/// ```
///
/// Generates `ID`, `PHASE` and `LABEL` constants plus
/// `fn target(inputs, outputs, action) -> crate::planner::Target`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Task"
        })
        .cloned()
        .collect()
}

struct TaskMeta {
    id: String,
    phase: String,
    default_label: String,
}

fn parse_meta(attr: TokenStream, struct_ident: &syn::Ident) -> syn::Result<TaskMeta> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut default_label: Option<String> = None;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "default_label" => default_label = Some(lit_str(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing id"))?;
    if id.trim().is_empty() || id.contains(char::is_whitespace) {
        return Err(syn::Error::new(
            struct_ident.span(),
            "Task: id must be non-empty and contain no whitespace",
        ));
    }
    Ok(TaskMeta {
        id,
        phase: phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing phase"))?,
        default_label: default_label
            .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing default_label"))?,
    })
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    if !matches!(st.fields, syn::Fields::Unit) {
        return Err(syn::Error::new(
            st.fields.span(),
            "Task: expected a unit struct",
        ));
    }

    let meta = parse_meta(attr, &struct_ident)?;
    let id_lit = meta.id;
    let phase_lit = meta.phase;
    let label_lit = meta.default_label;

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id_lit;
            pub const PHASE: &'static str = #phase_lit;
            pub const LABEL: &'static str = #label_lit;

            pub fn target<F>(
                inputs: ::std::vec::Vec<::std::path::PathBuf>,
                outputs: ::std::vec::Vec<::std::path::PathBuf>,
                action: F,
            ) -> crate::planner::Target
            where
                F: Fn(&mut crate::executor::ExecCtx) -> crate::Result<()> + 'static,
            {
                crate::planner::Target::new(
                    #id_lit,
                    #label_lit,
                    #phase_lit,
                    inputs,
                    outputs,
                    action,
                )
            }
        }
    };

    Ok(expanded.into())
}
