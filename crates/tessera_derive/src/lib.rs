use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod dist;

/// Forwards `HasWorld`, `HasRange`, `HasShape` and `HasPmap` to the field marked `#[distributed]`,
/// or to the only field of a tuple struct.
///
/// Struct-level options: `#[distributed(crate = "crate", bound = "T: Scalar")]`.
#[proc_macro_derive(Distributed, attributes(distributed))]
pub fn derive_distributed(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = dist::derive_distributed(input);
    expanded.into()
}
