/// Define a unit error type whose [`Display`] output is its doc string.
///
/// ```ignore
/// static_str_error! {
///     #[doc = "request aborted due to exhausted concurrency limit"]
///     pub struct LimitReached;
/// }
/// ```
///
/// [`Display`]: std::fmt::Display
macro_rules! static_str_error {
    (
        #[doc = $desc:literal]
        $(#[$m:meta])*
        $vis:vis struct $name:ident;
    ) => {
        #[doc = $desc]
        $(#[$m])*
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        #[non_exhaustive]
        $vis struct $name;

        impl $name {
            #[doc = concat!("Create a new [`", stringify!($name), "`].")]
            #[must_use]
            pub const fn new() -> Self {
                Self
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($desc)
            }
        }

        impl ::std::error::Error for $name {}
    };
}
