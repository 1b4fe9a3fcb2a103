#![recursion_limit = "256"]

//! `#[derive(Equivalence)]` for structs whose fields are themselves `Equivalence` types.
//!
//! The generated datatype is built once per process and shared. If the `spmd` crate is renamed
//! in `Cargo.toml`, point the macro at it with `#[spmd(crate = "::renamed")]`.

type TokenStream1 = proc_macro::TokenStream;
type TokenStream2 = proc_macro2::TokenStream;

use quote::quote;
use syn::{Fields, Type};

#[proc_macro_derive(Equivalence, attributes(spmd))]
pub fn create_user_datatype(input: TokenStream1) -> TokenStream1 {
    let ast: syn::DeriveInput = syn::parse(input).expect("Couldn't parse struct");
    let krate = match crate_path(&ast.attrs) {
        Ok(krate) => krate,
        Err(e) => return e.to_compile_error().into(),
    };
    let result = match ast.data {
        syn::Data::Enum(_) => panic!("#[derive(Equivalence)] is not compatible with enums"),
        syn::Data::Union(_) => panic!("#[derive(Equivalence)] is not compatible with unions"),
        syn::Data::Struct(ref s) => equivalence_for_struct(&krate, &ast, &s.fields),
    };
    result.into()
}

/// Path of the `spmd` crate, `::spmd` unless overridden by `#[spmd(crate = "...")]`.
fn crate_path(attrs: &[syn::Attribute]) -> syn::Result<syn::Path> {
    let mut krate: syn::Path = syn::parse_quote!(::spmd);
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("spmd")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let path: syn::LitStr = meta.value()?.parse()?;
                krate = path.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported spmd attribute, expected `crate = \"...\"`"))
            }
        })?;
    }
    Ok(krate)
}

fn offset_of(
    krate: &syn::Path,
    type_ident: &dyn quote::ToTokens,
    field_name: &dyn quote::ToTokens,
) -> TokenStream2 {
    quote!(#krate::internal::memoffset::offset_of!(#type_ident, #field_name))
}

fn equivalence_for_tuple_field(krate: &syn::Path, type_tuple: &syn::TypeTuple) -> TokenStream2 {
    let field_blocklengths = type_tuple.elems.iter().map(|_| quote! {1 as #krate::Count});
    let blocklengths = quote! {[#(#field_blocklengths),*]};

    let field_displacements = type_tuple.elems.iter().enumerate().map(|(i, _)| {
        let field = syn::Index::from(i);
        quote!(#krate::internal::memoffset::offset_of_tuple!(#type_tuple, #field))
    });
    let displacements = quote! {[#(#field_displacements as #krate::Address),*]};

    let field_datatypes = type_tuple
        .elems
        .iter()
        .map(|elem| equivalence_for_type(krate, elem));
    let datatypes =
        quote! {[#(#krate::datatype::UncommittedDatatypeRef::from(#field_datatypes)),*]};

    quote! {
        &#krate::datatype::UncommittedUserDatatype::structured(
            &#blocklengths,
            &#displacements,
            &#datatypes,
        )
    }
}

fn equivalence_for_array_field(krate: &syn::Path, type_array: &syn::TypeArray) -> TokenStream2 {
    let ty = equivalence_for_type(krate, &type_array.elem);
    let len = &type_array.len;
    quote! {
        &#krate::datatype::UncommittedUserDatatype::contiguous(
            (#len) as #krate::Count,
            &#krate::datatype::UncommittedDatatypeRef::from(#ty),
        )
    }
}

fn equivalence_for_type(krate: &syn::Path, ty: &syn::Type) -> TokenStream2 {
    match ty {
        Type::Path(ref type_path) => quote!(
                <#type_path as #krate::datatype::Equivalence>::equivalent_datatype()),
        Type::Tuple(ref type_tuple) => equivalence_for_tuple_field(krate, type_tuple),
        Type::Array(ref type_array) => equivalence_for_array_field(krate, type_array),
        Type::Paren(ref paren) => equivalence_for_type(krate, &paren.elem),
        _ => panic!("Unsupported type!"),
    }
}

fn equivalence_for_struct(
    krate: &syn::Path,
    ast: &syn::DeriveInput,
    fields: &Fields,
) -> TokenStream2 {
    let ident = &ast.ident;

    let field_blocklengths = fields.iter().map(|_| quote! {1 as #krate::Count});
    let blocklengths = quote! {[#(#field_blocklengths),*]};

    let field_displacements: Vec<_> = match fields {
        Fields::Named(ref fields) => fields
            .named
            .iter()
            .map(|field| offset_of(krate, &ident, field.ident.as_ref().unwrap()))
            .collect(),
        Fields::Unnamed(ref fields) => fields
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, _)| offset_of(krate, &ident, &syn::Index::from(i)))
            .collect(),
        Fields::Unit => vec![],
    };

    let displacements = quote! {[#(#field_displacements as #krate::Address),*]};

    let field_datatypes = fields.iter().map(|field| equivalence_for_type(krate, &field.ty));
    let datatypes =
        quote! {[#(#krate::datatype::UncommittedDatatypeRef::from(#field_datatypes)),*]};

    quote! {
        unsafe impl #krate::datatype::Equivalence for #ident {
            type Out = #krate::datatype::DatatypeRef<'static>;
            fn equivalent_datatype() -> Self::Out {
                use #krate::raw::AsRaw;

                static DATATYPE: #krate::internal::once_cell::sync::OnceCell<
                    #krate::datatype::UserDatatype,
                > = #krate::internal::once_cell::sync::OnceCell::new();

                let datatype = DATATYPE.get_or_init(|| {
                    #krate::datatype::UserDatatype::structured::<
                        #krate::datatype::UncommittedDatatypeRef,
                    >(&#blocklengths, &#displacements, &#datatypes)
                });

                #krate::datatype::DatatypeRef::from_raw(datatype.as_raw().clone())
            }
        }
    }
}
