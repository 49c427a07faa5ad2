//! Attribute macros that remove the derive boilerplate from trickle's
//! metric, aggregate and report types.
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, ItemStruct};

extern crate proc_macro;

fn data_derives() -> TokenStream2 {
    quote! {
        #[derive(
            ::serde::Serialize,
            ::serde::Deserialize,
            ::std::cmp::PartialOrd,
            ::std::cmp::PartialEq,
            ::std::fmt::Debug,
            ::std::clone::Clone
        )]
    }
}

/// Derives the bounds required by `trickle::Metric` and implements it.
#[proc_macro_attribute]
pub fn metric(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let ident = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let derives = data_derives();
    let expanded = quote! {
        #derives
        #ast

        impl #impl_generics ::trickle::Metric for #ident #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}

/// Derives the bounds required by `trickle::Aggregate`.
///
/// The trait itself still has to be implemented by hand.
#[proc_macro_attribute]
pub fn aggregate(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let derives = data_derives();
    let expanded = quote! {
        #derives
        #ast
    };

    TokenStream::from(expanded)
}

/// Derives serde and `Debug` for a report type and implements
/// `trickle::Report<A>` for the aggregate given as argument.
///
/// ```ignore
/// #[report(SummaryAggregate)]
/// struct StageSummary { rows: Vec<StageSummaryRow> }
/// ```
#[proc_macro_attribute]
pub fn report(attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let aggregate = parse_macro_input!(attr as syn::Type);
    let ident = &ast.ident;
    let expanded = quote! {
        #[derive(
            ::serde::Serialize,
            ::serde::Deserialize,
            ::std::fmt::Debug,
            ::std::clone::Clone,
            ::std::cmp::PartialEq
        )]
        #ast

        impl ::trickle::Report<#aggregate> for #ident {}
    };

    TokenStream::from(expanded)
}
