//! Python sources bound into the execution host alongside the caller's code.
//!
//! `SafeArray` and `SafeTable` mirror [`crate::safe_data`] so results computed
//! inside the sandbox agree with the ones the engine computes for named
//! analyses.

/// Defines `is_number`, `SafeArray`, `SafeTable` and `to_json` at function
/// body indentation.
pub const SAFE_DATA_SOURCE: &str = r#"
    def is_number(value):
        return isinstance(value, (int, float)) and not isinstance(value, bool)

    def is_scalar(value):
        return value is None or isinstance(value, (str, int, float, bool))

    def scalar_key(value):
        if is_number(value):
            return ("n", value)
        return (type(value).__name__, value)

    def scalar_eq(left, right):
        return scalar_key(left) == scalar_key(right)

    def sort_key(value):
        if is_number(value):
            return (0, value)
        if isinstance(value, str):
            return (1, value)
        return (2, value)

    def compare(op, left, right):
        if op == "eq":
            return scalar_eq(left, right)
        if op == "ne":
            return not scalar_eq(left, right)
        if op == "contains":
            return isinstance(left, str) and isinstance(right, str) and right in left
        if op == "in":
            return isinstance(right, (list, tuple)) and any(scalar_eq(left, r) for r in right)
        if op in ("gt", "ge", "lt", "le"):
            both_numbers = is_number(left) and is_number(right)
            both_text = isinstance(left, str) and isinstance(right, str)
            if not (both_numbers or both_text):
                return False
            if op == "gt":
                return left > right
            if op == "ge":
                return left >= right
            if op == "lt":
                return left < right
            return left <= right
        raise ValueError("unknown comparison '%s'" % op)

    class SafeArray:
        __slots__ = ("_values",)

        def __init__(self, values=()):
            if isinstance(values, SafeArray):
                values = values._values
            items = []
            for value in values:
                if not is_number(value):
                    raise TypeError("SafeArray holds numbers only, got %s" % type(value).__name__)
                items.append(value)
            object.__setattr__(self, "_values", tuple(items))

        def __setattr__(self, name, value):
            raise AttributeError("SafeArray is immutable")

        def __len__(self):
            return len(self._values)

        def __iter__(self):
            return iter(self._values)

        def __getitem__(self, index):
            if isinstance(index, slice):
                return SafeArray(self._values[index])
            return self._values[index]

        def __eq__(self, other):
            return isinstance(other, SafeArray) and self._values == other._values

        def __repr__(self):
            return "SafeArray(%r)" % (list(self._values),)

        def to_list(self):
            return list(self._values)

        def count(self):
            return len(self._values)

        def sum(self):
            return sum(self._values)

        def mean(self):
            if not self._values:
                return None
            return sum(self._values) / len(self._values)

        def variance(self, ddof=0):
            n = len(self._values)
            if n - ddof <= 0:
                return None
            m = sum(self._values) / n
            return sum((x - m) ** 2 for x in self._values) / (n - ddof)

        def std(self, ddof=0):
            v = self.variance(ddof)
            return None if v is None else _math.sqrt(v)

        def min(self):
            return min(self._values) if self._values else None

        def max(self):
            return max(self._values) if self._values else None

        def percentile(self, p):
            if not is_number(p) or p < 0 or p > 100:
                raise ValueError("percentile must be between 0 and 100")
            if not self._values:
                return None
            ordered = sorted(self._values)
            rank = (len(ordered) - 1) * (p / 100.0)
            lower = int(_math.floor(rank))
            upper = int(_math.ceil(rank))
            if lower == upper:
                return ordered[lower]
            return ordered[lower] + (ordered[upper] - ordered[lower]) * (rank - lower)

        def median(self):
            return self.percentile(50)

        def cumsum(self):
            total = 0
            out = []
            for x in self._values:
                total += x
                out.append(total)
            return SafeArray(out)

        def filter(self, predicate):
            return SafeArray([x for x in self._values if predicate(x)])

        def map(self, fn):
            return SafeArray([fn(x) for x in self._values])

        def sort(self, descending=False):
            return SafeArray(sorted(self._values, reverse=bool(descending)))

        def describe(self):
            return {
                "count": len(self._values),
                "mean": self.mean(),
                "std": self.std(),
                "min": self.min(),
                "p25": self.percentile(25),
                "median": self.median(),
                "p75": self.percentile(75),
                "max": self.max(),
            }

    aggregation_funcs = ("count", "sum", "mean", "min", "max", "median", "std", "distinct")

    def normalize_aggregation(spec):
        if isinstance(spec, dict):
            column, func, alias = spec.get("column"), spec.get("func"), spec.get("alias")
        elif isinstance(spec, (list, tuple)) and len(spec) in (2, 3):
            column, func = spec[0], spec[1]
            alias = spec[2] if len(spec) == 3 else None
        else:
            raise TypeError("aggregation must be a mapping or a (column, func[, alias]) tuple")
        if func not in aggregation_funcs:
            raise ValueError("unknown aggregation '%s'" % func)
        if column is None and func != "count":
            raise ValueError("aggregation '%s' needs a column" % func)
        if alias is None:
            alias = func if column is None else "%s_%s" % (func, column)
        return column, func, alias

    def apply_aggregation(table, column, func):
        if func == "count":
            if column is None:
                return len(table)
            return sum(1 for value in table.values(column) if value is not None)
        if func == "distinct":
            seen = set()
            for value in table.values(column):
                if value is not None:
                    seen.add(scalar_key(value))
            return len(seen)
        numbers = table.column(column)
        if func == "sum":
            return numbers.sum()
        if func == "mean":
            return numbers.mean()
        if func == "min":
            return numbers.min()
        if func == "max":
            return numbers.max()
        if func == "median":
            return numbers.median()
        return numbers.std()

    class SafeTable:
        __slots__ = ("_rows",)

        def __init__(self, rows=()):
            if isinstance(rows, SafeTable):
                rows = rows._rows
            frozen = []
            for index, row in enumerate(rows):
                if not isinstance(row, dict):
                    raise TypeError("row %d is not a mapping" % index)
                clean = {}
                for key, value in row.items():
                    if not isinstance(key, str):
                        raise TypeError("row %d has a non-text column name" % index)
                    if not is_scalar(value):
                        raise TypeError("row %d column '%s' is not a scalar" % (index, key))
                    clean[key] = value
                frozen.append(clean)
            object.__setattr__(self, "_rows", tuple(frozen))

        def __setattr__(self, name, value):
            raise AttributeError("SafeTable is immutable")

        def __len__(self):
            return len(self._rows)

        def __iter__(self):
            return iter([dict(row) for row in self._rows])

        def __getitem__(self, index):
            if isinstance(index, slice):
                return SafeTable(self._rows[index])
            return dict(self._rows[index])

        def __repr__(self):
            return "SafeTable(%d rows, columns=%r)" % (len(self._rows), self.columns)

        @property
        def columns(self):
            seen = []
            for row in self._rows:
                for key in row:
                    if key not in seen:
                        seen.append(key)
            return seen

        def to_list(self):
            return [dict(row) for row in self._rows]

        def filter(self, predicate):
            return SafeTable([row for row in self._rows if predicate(dict(row))])

        def where(self, column, op="eq", value=None):
            return SafeTable([row for row in self._rows if compare(op, row.get(column), value)])

        def select(self, columns):
            names = list(columns)
            return SafeTable([{name: row.get(name) for name in names} for row in self._rows])

        def sort_by(self, column, descending=False):
            present = [row for row in self._rows if row.get(column) is not None]
            missing = [row for row in self._rows if row.get(column) is None]
            present.sort(key=lambda row: sort_key(row[column]), reverse=bool(descending))
            return SafeTable(present + missing)

        def limit(self, n):
            if not isinstance(n, int) or n < 0:
                raise ValueError("limit must be a non-negative integer")
            return SafeTable(self._rows[:n])

        def column(self, name):
            return SafeArray([row[name] for row in self._rows if is_number(row.get(name))])

        def values(self, name):
            return [row.get(name) for row in self._rows]

        def group_by(self, column):
            order = []
            groups = {}
            for row in self._rows:
                value = row.get(column)
                key = scalar_key(value)
                if key not in groups:
                    groups[key] = []
                    order.append((key, value))
                groups[key].append(row)
            return [(value, SafeTable(groups[key])) for key, value in order]

        def aggregate(self, aggregations, by=None):
            specs = [normalize_aggregation(spec) for spec in aggregations]
            if by is None:
                groups = [(None, self)]
            else:
                groups = self.group_by(by)
            out = []
            for value, table in groups:
                row = {} if by is None else {by: value}
                for column, func, alias in specs:
                    row[alias] = apply_aggregation(table, column, func)
                out.append(row)
            return SafeTable(out)

    def to_json(value):
        if isinstance(value, (SafeArray, SafeTable)):
            return value.to_list()
        raise TypeError("Object of type %s is not JSON serializable" % type(value).__name__)
"#;

/// Defines `read_only_connect` and patches the embedded database module so
/// every connection is guarded. Needs `check_statement`, `SafeTable`,
/// `emit` and `_sqlite3` in scope.
pub const DATABASE_SOURCE: &str = r##"
    def reject_statement(sql, reason):
        emit({"status": "data_write_rejected", "error": "%s: %s" % (reason, str(sql)[:200])}, 4)

    def guard_statement(sql):
        reason = check_statement(sql)
        if reason is not None:
            reject_statement(sql, reason)

    def wrap_cursor(raw):
        class ReadOnlyCursor:
            __slots__ = ()

            def execute(self, sql, parameters=()):
                guard_statement(sql)
                raw.execute(sql, parameters)
                return self

            def executemany(self, sql, seq_of_parameters):
                reject_statement(sql, "batch mutation calls are not permitted")

            def executescript(self, script):
                guard_statement(script)
                raw.executescript(script)
                return self

            def fetchone(self):
                return raw.fetchone()

            def fetchmany(self, size=1):
                return raw.fetchmany(size)

            def fetchall(self):
                return raw.fetchall()

            @property
            def description(self):
                return raw.description

            def __iter__(self):
                return iter(raw.fetchall())

            def close(self):
                raw.close()

        return ReadOnlyCursor()

    def wrap_connection(raw):
        class ReadOnlyConnection:
            __slots__ = ()

            def cursor(self):
                return wrap_cursor(raw.cursor())

            def execute(self, sql, parameters=()):
                guard_statement(sql)
                return wrap_cursor(raw.execute(sql, parameters))

            def executemany(self, sql, seq_of_parameters):
                reject_statement(sql, "batch mutation calls are not permitted")

            def executescript(self, script):
                guard_statement(script)
                return wrap_cursor(raw.executescript(script))

            def commit(self):
                reject_statement("COMMIT", "transaction commits are not permitted")

            def rollback(self):
                pass

            def table(self, sql, parameters=()):
                guard_statement(sql)
                cursor = raw.execute(sql, parameters)
                names = [d[0] for d in cursor.description or ()]
                return SafeTable([dict(zip(names, row)) for row in cursor.fetchall()])

            def close(self):
                raw.close()

            def __enter__(self):
                return self

            def __exit__(self, *exc_info):
                return False

        return ReadOnlyConnection()

    def quote_identifier(name):
        return '"%s"' % str(name).replace('"', '""')

    if _sqlite3 is not None:
        original_sqlite_connect = _sqlite3.connect

        def read_only_connect(tables=None, database=None):
            if database is not None:
                location = str(database).replace("?", "%3f").replace("#", "%23")
                raw = original_sqlite_connect("file:%s?mode=ro" % location, uri=True)
            else:
                raw = original_sqlite_connect(":memory:")
            for name, rows in (tables or {}).items():
                table = rows if isinstance(rows, SafeTable) else SafeTable(rows)
                columns = table.columns
                if not columns:
                    continue
                quoted = quote_identifier(name)
                raw.execute("CREATE TABLE %s (%s)" % (quoted, ", ".join(quote_identifier(c) for c in columns)))
                raw.executemany(
                    "INSERT INTO %s VALUES (%s)" % (quoted, ", ".join("?" for _ in columns)),
                    [tuple(row.get(c) for c in columns) for row in table.to_list()],
                )
            raw.commit()
            raw.execute("PRAGMA query_only = ON")
            return wrap_connection(raw)

        def guarded_sqlite_connect(database=":memory:", *args, **kwargs):
            if database == ":memory:":
                return read_only_connect()
            return read_only_connect(database=database)

        def blocked_connection_class(*args, **kwargs):
            raise PermissionError("direct connection construction is not permitted")

        for module in (_sqlite3, getattr(_sqlite3, "dbapi2", None)):
            if module is not None:
                module.connect = guarded_sqlite_connect
                module.Connection = blocked_connection_class
    else:
        def read_only_connect(tables=None, database=None):
            raise RuntimeError("embedded database support is unavailable")
"##;
