use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derives helpers for partial updates of a struct made of `Option<T>` fields.
///
/// Generated methods:
/// * `fields_with_value()` lists the names of fields that are `Some`
/// * `bind_values(query)` binds the `Some` values to a sqlx SQLite query in the same order
///
/// Non-`Option` fields are ignored by both.
#[proc_macro_derive(PatchFields)]
pub fn patch_fields(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let struct_name = input.ident;

    let fields = if let syn::Data::Struct(syn::DataStruct {
                                              fields: syn::Fields::Named(ref fields),
                                              ..
                                          }) = input.data {
        fields
    } else {
        return syn::Error::new_spanned(&struct_name, "PatchFields supports only structs with named fields")
            .to_compile_error()
            .into();
    };

    let option_fields = fields.named.iter().filter_map(|field| {
        let field_name = field.ident.as_ref()?;
        // only Option<T> fields take part in a patch
        if let syn::Type::Path(type_path) = &field.ty {
            if type_path.path.segments.last()?.ident == "Option" {
                return Some(field_name.clone());
            }
        }
        None
    }).collect::<Vec<_>>();

    let checks = option_fields.iter().map(|field_name| {
        quote! {
            if self.#field_name.is_some() {
                fields.push(stringify!(#field_name));
            }
        }
    });
    let binds = option_fields.iter().map(|field_name| {
        quote! {
            if let Some(value) = &self.#field_name {
                query = query.bind(value);
            }
        }
    });

    let expanded = quote! {
        impl #struct_name {
            pub fn fields_with_value(&self) -> Vec<&'static str> {
                let mut fields = Vec::new();
                #(#checks)*
                fields
            }
            pub fn bind_values<'q>(
                &'q self,
                mut query: ::sqlx::query::Query<'q, ::sqlx::Sqlite, ::sqlx::sqlite::SqliteArguments<'q>>,
            ) -> ::sqlx::query::Query<'q, ::sqlx::Sqlite, ::sqlx::sqlite::SqliteArguments<'q>> {
                #(#binds)*
                query
            }
        }
    };

    TokenStream::from(expanded)
}
