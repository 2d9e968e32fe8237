use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

/// Options collected from struct-level `#[distributed(...)]` attributes.
#[derive(Default)]
struct Options {
    krate: Option<Path>,
    bounds: Punctuated<WherePredicate, Token![,]>,
}

fn parse_options(input: &DeriveInput) -> syn::Result<Options> {
    let mut options = Options::default();
    for attr in input
        .attrs
        .iter()
        .filter(|attr| attr.path().is_ident("distributed"))
    {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let s: LitStr = meta.value()?.parse()?;
                options.krate = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("bound") {
                let s: LitStr = meta.value()?.parse()?;
                let predicates =
                    s.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                options.bounds.extend(predicates);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate` and `bound`"))
            }
        })?;
    }
    Ok(options)
}

fn forward_access(input: &DeriveInput) -> syn::Result<TokenStream> {
    let fields = match &input.data {
        syn::Data::Struct(data) => &data.fields,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "`Distributed` can only be derived for structs",
            ));
        }
    };

    match fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(quote! { self.0 }),
        Fields::Unnamed(fields) => Err(syn::Error::new(
            fields.span(),
            "tuple structs must have exactly one field",
        )),
        Fields::Named(fields) => {
            let marked: Vec<_> = fields
                .named
                .iter()
                .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("distributed")))
                .collect();
            match marked.as_slice() {
                [field] => {
                    let ident = &field.ident;
                    Ok(quote! { self.#ident })
                }
                [] => Err(syn::Error::new(
                    fields.span(),
                    "no field marked with #[distributed] attribute",
                )),
                _ => Err(syn::Error::new(
                    fields.span(),
                    "multiple fields marked with #[distributed] attribute",
                )),
            }
        }
        Fields::Unit => Err(syn::Error::new(
            input.span(),
            "unit structs are not supported by `Distributed` derive",
        )),
    }
}

pub fn derive_distributed(input: DeriveInput) -> TokenStream {
    let forward = match forward_access(&input) {
        Ok(forward) => forward,
        Err(err) => return err.to_compile_error(),
    };
    let options = match parse_options(&input) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error(),
    };

    let base = match options.krate {
        Some(path) => quote!(#path),
        None => quote!(::tessera),
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, _) = input.generics.split_for_impl();

    let mut generics = input.generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(options.bounds);

    quote! {
        impl #impl_generics #base::dist::HasWorld for #name #ty_generics #where_clause {
            #[inline]
            fn world(&self) -> &#base::runtime::World {
                #base::dist::HasWorld::world(&#forward)
            }
        }

        impl #impl_generics #base::dist::HasRange for #name #ty_generics #where_clause {
            #[inline]
            fn trange(&self) -> &#base::range::TiledRange {
                #base::dist::HasRange::trange(&#forward)
            }
        }

        impl #impl_generics #base::dist::HasShape for #name #ty_generics #where_clause {
            #[inline]
            fn shape(&self) -> &#base::shape::Shape {
                #base::dist::HasShape::shape(&#forward)
            }
        }

        impl #impl_generics #base::dist::HasPmap for #name #ty_generics #where_clause {
            #[inline]
            fn pmap(&self) -> &#base::pmap::SharedPmap {
                #base::dist::HasPmap::pmap(&#forward)
            }
        }
    }
}
