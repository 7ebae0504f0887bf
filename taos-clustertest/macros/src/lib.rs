extern crate proc_macro;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, parse_quote, Ident, ItemFn};

/// Marks an async test that deploys a real taosd cluster.
///
/// The test runs on a multi-threaded tokio runtime, serialized with every other clustertest (or
/// with the ones sharing the optional key, `#[clustertest(key)]`), and returns immediately unless
/// `RUN_CLUSTER_TESTS` is set.
#[proc_macro_attribute]
pub fn clustertest(args: TokenStream, input: TokenStream) -> TokenStream {
    let key = parse_macro_input!(args as Option<Ident>);
    let input_fn = parse_macro_input!(input as ItemFn);

    let fn_block = *input_fn.block;
    let fn_name = input_fn.sig.ident.to_string();

    // Skip unless asked for, then enable test logging and log the test name as a debug log
    let fn_block_with_tracing = parse_quote! {{
        if ::std::env::var_os("RUN_CLUSTER_TESTS").is_none() {
            eprintln!("skipping {}: RUN_CLUSTER_TESTS is not set", #fn_name);
            return;
        }
        ::taos_clustertest::logging::init_test_logging();
        ::tracing::debug!("Starting {}", #fn_name);
        #fn_block
    }};

    let test_with_tracing = ItemFn {
        block: Box::new(fn_block_with_tracing),
        ..input_fn
    };

    let serial = match key {
        Some(key) => quote!(#[::serial_test::serial(#key)]),
        None => quote!(#[::serial_test::serial]),
    };

    let result = quote! {
        #[::tokio::test(flavor = "multi_thread")]
        #serial
        #test_with_tracing
    };
    result.into()
}
