use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemFn, LitInt, parse_macro_input};

/// Registers a function in the built-in XNU emulation table.
///
/// The argument names the trap class and number:
///
/// - `bsd = N`: BSD syscall `N` (positive `x16`)
/// - `mach = N`: Mach trap `N` (`x16 == -N`)
/// - `mig = ID`: MIG routine answered by `mach_msg_trap` for message id `ID`
///
/// # Example
///
/// ```ignore
/// #[xnu_trap(bsd = 372)]
/// fn thread_selfid(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
///     ctx.bsd_return(1)
/// }
/// ```
///
/// Expands to:
///
/// ```ignore
/// fn thread_selfid(_kernel: &Kernel, ctx: &mut SyscallContext<'_>) -> Result<()> {
///     ctx.bsd_return(1)
/// }
///
/// #[linkme::distributed_slice(crate::sys::darwin::syscall::XNU_TRAPS)]
/// static _XNU_TRAP_THREAD_SELFID: crate::sys::darwin::syscall::XnuTrap =
///     crate::sys::darwin::syscall::XnuTrap {
///         class: crate::sys::darwin::syscall::TrapClass::Bsd,
///         number: 372,
///         name: "thread_selfid",
///         handler: thread_selfid,
///     };
/// ```
#[proc_macro_attribute]
pub fn xnu_trap(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut class: Option<&'static str> = None;
    let mut number: Option<i64> = None;
    let parser = syn::meta::parser(|meta| {
        let kind = if meta.path.is_ident("bsd") {
            "bsd"
        } else if meta.path.is_ident("mach") {
            "mach"
        } else if meta.path.is_ident("mig") {
            "mig"
        } else {
            return Err(meta.error("expected `bsd`, `mach` or `mig`"));
        };
        if class.is_some() {
            return Err(meta.error("a trap has exactly one class"));
        }
        let lit: LitInt = meta.value()?.parse()?;
        number = Some(lit.base10_parse::<i64>()?);
        class = Some(kind);
        Ok(())
    });
    parse_macro_input!(attr with parser);

    let input = parse_macro_input!(item as ItemFn);
    let (Some(class), Some(number)) = (class, number) else {
        return syn::Error::new_spanned(&input.sig.ident, "missing `bsd = N`, `mach = N` or `mig = ID`")
            .to_compile_error()
            .into();
    };

    let fn_name = &input.sig.ident;
    let name = fn_name.to_string();
    let static_name = format_ident!("_XNU_TRAP_{}", name.to_uppercase());

    let registration = if class == "mig" {
        quote! {
            #[linkme::distributed_slice(crate::sys::darwin::mach_msg::MIG_ROUTINES)]
            static #static_name: crate::sys::darwin::mach_msg::MigRoutine =
                crate::sys::darwin::mach_msg::MigRoutine {
                    id: #number as u32,
                    name: #name,
                    handler: #fn_name,
                };
        }
    } else {
        let variant = if class == "bsd" {
            format_ident!("Bsd")
        } else {
            format_ident!("Mach")
        };
        quote! {
            #[linkme::distributed_slice(crate::sys::darwin::syscall::XNU_TRAPS)]
            static #static_name: crate::sys::darwin::syscall::XnuTrap =
                crate::sys::darwin::syscall::XnuTrap {
                    class: crate::sys::darwin::syscall::TrapClass::#variant,
                    number: #number,
                    name: #name,
                    handler: #fn_name,
                };
        }
    };

    let expanded = quote! {
        #input
        #registration
    };

    TokenStream::from(expanded)
}
