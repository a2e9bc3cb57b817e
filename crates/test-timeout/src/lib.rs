//! Test attributes that fail a test instead of hanging it.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh
//! current-thread runtime. Both take an optional limit in seconds
//! (default 60). Slow machines can stretch every limit by setting
//! `TEST_TIMEOUT_SCALE` to an integer multiplier.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &[&["tokio", "test"]]);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };

    expand(attrs, vis, sig, timeout_secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &[&["test"]]);
    let body = quote! {
        let _ = timeout_duration;
        #block
    };

    expand(attrs, vis, sig, timeout_secs, body).into()
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
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

/// Runs `body` on a helper thread and waits at most the (scaled) timeout for
/// it. A panic inside the body is resumed on the test thread so the original
/// assertion message is reported.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    timeout_secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let scale: u64 = std::env::var("TEST_TIMEOUT_SCALE")
                .ok()
                .and_then(|value| value.parse().ok())
                .filter(|scale: &u64| *scale > 0)
                .unwrap_or(1);
            let timeout_duration = std::time::Duration::from_secs(#timeout_secs * scale);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

/// Drops test-harness attributes the expansion re-adds itself.
fn strip_attrs(attrs: Vec<Attribute>, paths: &[&[&str]]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !paths
                .iter()
                .any(|path| segments.iter().map(String::as_str).eq(path.iter().copied()))
        })
        .collect()
}
