//! A derive macro for the `Entity` trait in the `chronik` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// Derives the `Entity` trait for a struct.
///
/// The entity id is taken from the field marked `#[entity(id)]`, or from the
/// field named `id` when no field is marked. The field's value is rendered
/// with `to_string`.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn entity_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            _ => panic!("Entity derive macro requires named fields"),
        },
        _ => panic!("Entity derive macro can only be used on structs"),
    };

    let marked = fields.iter().find(|field| {
        field.attrs.iter().any(|attr| {
            if !attr.path().is_ident("entity") {
                return false;
            }
            let mut is_id = false;
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    is_id = true;
                }
                Ok(())
            });
            is_id
        })
    });
    let id_field = marked
        .or_else(|| {
            fields
                .iter()
                .find(|field| field.ident.as_ref().is_some_and(|ident| ident == "id"))
        })
        .expect("Entity derive macro needs a field named `id` or marked #[entity(id)]");
    let id_ident = id_field.ident.as_ref().expect("named field");

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics chronik::Entity for #name #ty_generics #where_clause {
            fn entity_id(&self) -> ::std::string::String {
                self.#id_ident.to_string()
            }
        }
    };

    TokenStream::from(expanded)
}
