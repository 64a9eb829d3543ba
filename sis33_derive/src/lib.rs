use proc_macro::TokenStream;
use quote::quote;
use syn::{parse, parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(Wire)]
/// Derived on a control-request shape to generate its `Wire` codec from the declared field order.
///
/// Every field type must itself implement `Wire`. The generated impl names `Wire`, `Abi`,
/// `WireReader`, `WireWriter`, `WireError` and `align_up` unqualified, so they have to be in scope
/// next to the derive.
pub fn derive_wire(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let shape_name = input.ident;
    let Data::Struct(data) = input.data else {
        panic!("Wire can only be derived on structs");
    };
    let Fields::Named(fields) = data.fields else {
        panic!("Wire needs a struct with named fields, the names are the field table");
    };
    let names: Vec<_> = fields
        .named
        .iter()
        .filter_map(|f| f.ident.clone())
        .collect();
    let types: Vec<_> = fields.named.iter().map(|f| f.ty.clone()).collect();

    let generated = quote! {
        impl Wire for #shape_name {
            fn align(abi: Abi) -> usize {
                let mut align = 1usize;
                #( align = align.max(<#types as Wire>::align(abi)); )*
                align
            }

            fn size(abi: Abi) -> usize {
                let mut offset = 0usize;
                #(
                    offset = align_up(offset, <#types as Wire>::align(abi))
                        + <#types as Wire>::size(abi);
                )*
                align_up(offset, <Self as Wire>::align(abi))
            }

            fn encode(&self, __writer: &mut WireWriter) -> ::core::result::Result<(), WireError> {
                __writer.align_to(<Self as Wire>::align(__writer.abi()));
                #( Wire::encode(&self.#names, __writer)?; )*
                __writer.align_to(<Self as Wire>::align(__writer.abi()));
                Ok(())
            }

            fn decode(__reader: &mut WireReader<'_>) -> ::core::result::Result<Self, WireError> {
                __reader.align_to(<Self as Wire>::align(__reader.abi()))?;
                #( let #names = <#types as Wire>::decode(__reader)?; )*
                __reader.align_to(<Self as Wire>::align(__reader.abi()))?;
                Ok(Self { #( #names ),* })
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attaches the control-request number (the `nr` field of the ioctl encoding) to a request shape
pub fn request(attr: TokenStream, item: TokenStream) -> TokenStream {
    let nr = match parse::<syn::Lit>(attr).expect("Error parsing attribute") {
        syn::Lit::Int(v) => v,
        _ => panic!("The request number must be a literal integer that fits in a u8"),
    };
    // Get the struct name this number is for
    let item = parse_macro_input!(item as DeriveInput);
    let ident = item.ident.clone();

    let generated = quote! {
        impl #ident {
            /// Request number within the driver's ioctl type
            pub const NR: u8 = #nr;
        }
        #item
    };
    TokenStream::from(generated)
}
