use std::path::Path;

pub const PLAINTEXT: &str = "plaintext";
pub const BINARY: &str = "binary";

const EXTENSIONS: &[(&str, &str)] = &[
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("mts", "typescript"),
    ("cts", "typescript"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("rs", "rust"),
    ("py", "python"),
    ("pyi", "python"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("kts", "kotlin"),
    ("swift", "swift"),
    ("rb", "ruby"),
    ("php", "php"),
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("hh", "cpp"),
    ("cs", "csharp"),
    ("fs", "fsharp"),
    ("scala", "scala"),
    ("dart", "dart"),
    ("lua", "lua"),
    ("r", "r"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("erl", "erlang"),
    ("hs", "haskell"),
    ("clj", "clojure"),
    ("zig", "zig"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("html", "html"),
    ("htm", "html"),
    ("css", "css"),
    ("scss", "scss"),
    ("sass", "sass"),
    ("less", "less"),
    ("json", "json"),
    ("jsonc", "json"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("xml", "xml"),
    ("md", "markdown"),
    ("mdx", "markdown"),
    ("sql", "sql"),
    ("graphql", "graphql"),
    ("gql", "graphql"),
    ("proto", "protobuf"),
    ("sh", "shell"),
    ("bash", "shell"),
    ("zsh", "shell"),
    ("ps1", "powershell"),
    ("tf", "terraform"),
    ("txt", PLAINTEXT),
];

const FILE_NAMES: &[(&str, &str)] = &[
    ("dockerfile", "dockerfile"),
    ("makefile", "makefile"),
    ("gnumakefile", "makefile"),
    ("cmakelists.txt", "cmake"),
    ("gemfile", "ruby"),
    ("rakefile", "ruby"),
    ("justfile", "just"),
];

/// Maps a path to a language name. Unknown extensions are `plaintext`.
pub fn infer_language(path: &str) -> &'static str {
    let path = Path::new(path);
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().to_lowercase()) else {
        return PLAINTEXT;
    };
    if let Some((_, language)) = FILE_NAMES.iter().find(|(file, _)| *file == name) {
        return *language;
    }
    let Some(ext) = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
    else {
        return PLAINTEXT;
    };
    EXTENSIONS
        .iter()
        .find(|(candidate, _)| *candidate == ext)
        .map(|(_, language)| *language)
        .unwrap_or(PLAINTEXT)
}
