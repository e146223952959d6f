use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Run a synchronous test on a watchdog thread so a hang fails the test
/// instead of wedging the whole suite. Accepts an optional deadline in
/// seconds: `#[test_timeout::timeout(5)]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    expand(func, secs, Flavor::Sync)
}

/// Like `timeout`, but for async tests: the body runs on a fresh
/// current-thread Tokio runtime under both an async deadline and the
/// watchdog thread. Replaces `#[tokio::test]`.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_timeout_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let mut func = parse_macro_input!(item as ItemFn);
    if func.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    func.sig.asyncness = None;

    expand(func, secs, Flavor::Tokio)
}

enum Flavor {
    Sync,
    Tokio,
}

fn parse_timeout_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

fn expand(func: ItemFn, secs: u64, flavor: Flavor) -> TokenStream {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;

    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_entry_attribute(attr))
        .collect();

    let run: TokenStream2 = match flavor {
        Flavor::Sync => quote! {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block))
        },
        Flavor::Tokio => quote! {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime")
                    .block_on(async {
                        tokio::time::timeout(__deadline, async move #block)
                            .await
                            .expect("test timed out");
                    });
            }))
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let __deadline = std::time::Duration::from_secs(#secs);
            let (__tx, __rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let __outcome = #run;
                let _ = __tx.send(__outcome);
            });
            match __rx.recv_timeout(__deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited before reporting a result")
                }
            }
        }
    })
}

fn is_test_entry_attribute(attr: &Attribute) -> bool {
    let path = attr.path();
    if path.is_ident("test") {
        return true;
    }
    let mut segments = path.segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
